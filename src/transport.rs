use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio_serde::formats::SymmetricalBincode;
use tokio_serde::SymmetricallyFramed;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;

use crate::errors::P2pError;
use crate::models::peer::WireMessage;

/// Magic preamble sent by the dialing side of a handshake.
pub(crate) const MAGIC_STRING_REQUEST: &[u8] = b"6F2D8A41C7B3E59012D4F86A9C0B73E5";
/// Magic preamble sent back by the accepting side.
pub(crate) const MAGIC_STRING_RESPONSE: &[u8] = b"Hello mesh!\n";

/// A bincode-enveloped, length-delimited duplex frame stream.
pub(crate) type WireStream<S> = SymmetricallyFramed<
    Framed<S, LengthDelimitedCodec>,
    WireMessage,
    SymmetricalBincode<WireMessage>,
>;

/// The same frame rules apply to every connection of a given kind; the
/// maximum frame length is the payload cap for frames *received* on the
/// socket (inbound cap for accepted sockets, outbound cap for dialed ones).
fn codec_rules(max_frame_length: usize) -> LengthDelimitedCodec {
    let mut codec_rules = LengthDelimitedCodec::new();
    codec_rules.set_max_frame_length(max_frame_length);
    codec_rules
}

/// Wrap a raw duplex socket into the wire-message frame stream.
pub(crate) fn wrap_stream<S>(stream: S, max_frame_length: usize) -> WireStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let length_delimited = Framed::new(stream, codec_rules(max_frame_length));
    SymmetricallyFramed::new(length_delimited, SymmetricalBincode::default())
}

/// Open a TCP connection to a peer, bounded by the connect timeout.
pub(crate) async fn dial(
    address: SocketAddr,
    connect_timeout: Duration,
) -> Result<TcpStream, P2pError> {
    match tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(P2pError::PeerOutboundConnection(format!(
            "failed to connect to {address}: {e}"
        ))),
        Err(_) => Err(P2pError::PeerOutboundConnection(format!(
            "connection to {address} timed out after {connect_timeout:?}"
        ))),
    }
}
