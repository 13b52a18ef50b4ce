use ago_core::{read_frame, write_frame, AgoError, AgoResult, Event, Frame, Request, Response};
use std::path::PathBuf;
use tokio::net::UnixStream;

/// Thin control-socket client: one framed request per connection, one
/// response back, with an event stream in between for the streaming
/// operations.
pub struct DaemonClient {
    socket: PathBuf,
}

impl DaemonClient {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    pub async fn connect(&self) -> AgoResult<UnixStream> {
        UnixStream::connect(&self.socket).await.map_err(|_| {
            AgoError::NotRunning("daemon (start it with `ago daemon start`)".into())
        })
    }

    /// Send a non-streaming request and wait for the response.
    pub async fn request(&self, request: Request) -> AgoResult<Response> {
        self.stream(request, |_| {}).await
    }

    /// Send a request, handing each `Event` frame to `on_event`, and
    /// return the terminal `Response`.
    pub async fn stream(
        &self,
        request: Request,
        mut on_event: impl FnMut(&Event),
    ) -> AgoResult<Response> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, &Frame::Request(request)).await?;

        loop {
            match read_frame::<_, Frame>(&mut stream).await? {
                Some(Frame::Event(event)) => on_event(&event),
                Some(Frame::Response(response)) => return Ok(response),
                Some(Frame::Request(_)) => {
                    return Err(AgoError::DecodeFailure(
                        "daemon sent a request frame".into(),
                    ))
                }
                None => {
                    return Err(AgoError::SocketIo(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "daemon closed the connection before responding",
                    )))
                }
            }
        }
    }
}
