mod tcp;
mod traits;

pub use tcp::TcpConnector;
pub use traits::TransportConnector;
