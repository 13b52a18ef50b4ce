//! Plain-text rendering of daemon payloads and streamed events.

use ago_core::{ConversationEntry, Event, EventKind, Payload};
use ago_daemon::TrafficRecord;

pub fn print_payload(payload: &Payload) {
    match payload {
        Payload::Empty => {}
        Payload::Text(text) => println!("{text}"),
        Payload::Started { instance_id } => println!("{instance_id}"),

        Payload::Instances(instances) => {
            if instances.is_empty() {
                println!("No agents running.");
                return;
            }
            println!(
                "{:<28} {:<14} {:<28} {:<9} {:<8} STARTED",
                "INSTANCE", "TEMPLATE", "MODEL", "STATE", "PID"
            );
            for instance in instances {
                println!(
                    "{:<28} {:<14} {:<28} {:<9} {:<8} {}",
                    instance.instance_id,
                    instance.template,
                    instance.model,
                    instance.state.to_string(),
                    instance.pid,
                    instance.spawned_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }

        Payload::Instance(detail) => {
            let s = &detail.summary;
            println!("instance:  {}", s.instance_id);
            println!("template:  {}", s.template);
            println!("model:     {}", s.model);
            println!("state:     {}", s.state);
            println!("pid:       {}", s.pid);
            println!("started:   {}", s.spawned_at.to_rfc3339());
            println!("socket:    {}", detail.socket_path);
            println!("log:       {}", detail.log_path);
            println!("tools:     {}", detail.tools.join(", "));
        }

        Payload::Logs(entries) => {
            for entry in entries {
                print_log_entry(entry);
            }
        }

        Payload::Templates(templates) => {
            if templates.is_empty() {
                println!("No templates found.");
                return;
            }
            println!(
                "{:<16} {:<9} {:<9} DESCRIPTION",
                "NAME", "VERSION", "LAYER"
            );
            for template in templates {
                println!(
                    "{:<16} {:<9} {:<9} {}",
                    template.name, template.version, template.layer, template.description
                );
            }
        }

        Payload::Queues(queues) => {
            if queues.is_empty() {
                println!("No queues.");
                return;
            }
            println!(
                "{:<28} {:>6} {:>9} {:>12} LAST MESSAGE",
                "INSTANCE", "DEPTH", "DELIVERED", "DEAD-LETTER"
            );
            for queue in queues {
                println!(
                    "{:<28} {:>2}/{:<3} {:>9} {:>12} {}",
                    queue.instance_id,
                    queue.depth,
                    queue.capacity,
                    queue.delivered,
                    queue.dead_lettered,
                    queue.last_payload.as_deref().unwrap_or("-"),
                );
            }
        }

        Payload::Registries(registries) => {
            println!("{:<16} {:<8} {:>8}  URL", "NAME", "KIND", "PRIORITY");
            for registry in registries {
                println!(
                    "{:<16} {:<8} {:>8}  {}",
                    registry.name, registry.kind, registry.priority, registry.url
                );
            }
        }

        Payload::Error { kind, message } => eprintln!("{kind}: {message}"),
    }
}

pub fn print_event(event: &Event) {
    match event.kind {
        EventKind::Thinking => println!("· {}", event.payload),
        EventKind::ToolCall => println!("→ {}", event.payload),
        EventKind::Observation => println!("← {}", event.payload),
        EventKind::TurnComplete => println!("{}", event.payload),
        EventKind::TurnTruncated => {
            eprintln!("(turn truncated: reasoning step limit reached)")
        }
        EventKind::Error => eprintln!("error: {}", event.payload),
        EventKind::Log => match serde_json::from_str::<ConversationEntry>(&event.payload) {
            Ok(entry) => print_log_entry(&entry),
            Err(_) => println!("{}", event.payload),
        },
        EventKind::Queue => match serde_json::from_str::<TrafficRecord>(&event.payload) {
            Ok(record) => println!(
                "[{}] {} -> {}: {}",
                record.timestamp.format("%H:%M:%S"),
                record.from,
                record.to,
                record.preview
            ),
            Err(_) => println!("{}", event.payload),
        },
    }
}

fn print_log_entry(entry: &ConversationEntry) {
    println!(
        "[{}] {:<9} {}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.role.to_string() + ":",
        entry.content
    );
}
