//! The resident supervisor: spawns and supervises agent workers, brokers
//! named message flow over framed Unix-domain sockets, and serves the
//! control protocol the `ago` CLI speaks.

pub mod daemon;
pub mod home;
pub mod identity;
pub mod process;
pub mod registry_file;
pub mod router;
pub mod server;

pub use daemon::{Daemon, DaemonState};
pub use home::AgoHome;
pub use identity::resolve_agent;
pub use process::{ping_instance, ProcessManager};
pub use registry_file::{pid_alive, RegistryFile};
pub use router::{MessageRouter, TrafficRecord};
pub use server::ControlServer;
