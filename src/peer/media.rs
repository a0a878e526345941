use crate::error::NegotiationError;
use crate::peer::adapter::LocalTrack;
use crate::peer::types::MediaKind;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Захват локального медиа (камера/микрофон или их замена)
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<Vec<LocalTrack>, NegotiationError>;
}

/// Треки без реального устройства: сэмплы пишет владелец трека
#[derive(Debug, Clone)]
pub struct SyntheticCapture {
    pub audio: bool,
    pub video: bool,
    pub stream_id: String,
}

impl SyntheticCapture {
    pub fn new(audio: bool, video: bool) -> Self {
        Self {
            audio,
            video,
            stream_id: "roomcall-local".into(),
        }
    }
}

#[async_trait]
impl MediaSource for SyntheticCapture {
    async fn acquire(&self) -> Result<Vec<LocalTrack>, NegotiationError> {
        if !self.audio && !self.video {
            return Err(NegotiationError::MediaAccess(
                "neither audio nor video capture is enabled".into(),
            ));
        }

        let mut tracks = Vec::new();
        if self.audio {
            tracks.push(LocalTrack {
                kind: MediaKind::Audio,
                track: Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: 48000,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                        rtcp_feedback: vec![],
                    },
                    "audio".to_owned(),
                    self.stream_id.clone(),
                )),
            });
        }
        if self.video {
            tracks.push(LocalTrack {
                kind: MediaKind::Video,
                track: Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_VP8.to_owned(),
                        clock_rate: 90000,
                        ..Default::default()
                    },
                    "video".to_owned(),
                    self.stream_id.clone(),
                )),
            });
        }
        Ok(tracks)
    }
}
