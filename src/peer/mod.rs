pub mod adapter;
pub mod candidates;
pub mod connection;
pub mod ice;
pub mod media;
pub mod types;

pub use adapter::{AdapterEvent, AdapterEvents, LocalTrack, PeerConnectionAdapter, RemoteTrack};
pub use candidates::{CandidateBuffer, RemoteCandidateQueue};
pub use connection::WebRtcAdapter;
pub use ice::{IceServerProvider, StaticIceServers, XirsysProvider, DEFAULT_ICE_SERVERS};
pub use media::{MediaSource, SyntheticCapture};
pub use types::{IceCandidate, IceServer, MediaKind, SdpKind, ServerConfig, SessionDescription};
