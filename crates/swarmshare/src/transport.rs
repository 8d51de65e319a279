use tokio::io::{AsyncRead, AsyncWrite};

// Byte stream a connection handler runs over (TCP in production, in-memory in tests)
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type Transport = Box<dyn TransportStream>;

pub fn from_tcp(stream: tokio::net::TcpStream) -> Transport {
    stream.set_nodelay(true).ok();
    Box::new(stream)
}
