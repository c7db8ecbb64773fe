//! webrtc-rs backed peer connections

use super::native::{
    NativeConnectionFactory, NativeConnectionState, NativeEventKind, NativeEventSink,
    NativePeerConnection, NativeStats,
};
use crate::config::{CallConfig, DataChannelMode};
use crate::ice::IceCandidate;
use crate::media::devices::{MediaTrack, TrackKind};
use crate::signaling::protocol::{SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

type DataChannels = Arc<Mutex<HashMap<String, Arc<RTCDataChannel>>>>;

/// Creates webrtc-rs peer connections from a [`CallConfig`]
pub struct RtcConnectionFactory {
    rtc_config: RTCConfiguration,
}

impl RtcConnectionFactory {
    pub fn new(config: &CallConfig) -> Self {
        // Configure ICE servers (STUN/TURN)
        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        Self {
            rtc_config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl NativeConnectionFactory for RtcConnectionFactory {
    #[instrument(skip(self, events), fields(connection_id = %events.connection_id()))]
    async fn create(
        &self,
        peer_id: &str,
        events: NativeEventSink,
    ) -> Result<Arc<dyn NativePeerConnection>> {
        info!("Creating peer connection for {}", peer_id);

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtc(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_config.clone())
                .await
                .map_err(|e| Error::Negotiation(format!("Failed to create peer connection: {}", e)))?,
        );

        let channels: DataChannels = Arc::new(Mutex::new(HashMap::new()));
        install_callbacks(&pc, &events, &channels);

        Ok(Arc::new(RtcPeerConnection {
            peer_id: peer_id.to_string(),
            pc,
            events,
            senders: Mutex::new(HashMap::new()),
            channels,
        }))
    }
}

fn install_callbacks(pc: &Arc<RTCPeerConnection>, events: &NativeEventSink, channels: &DataChannels) {
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            // None marks end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => sink.emit(NativeEventKind::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                })),
                Err(e) => warn!("Failed to serialize local candidate: {}", e),
            }
        })
    }));

    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let sink = sink.clone();
        Box::pin(async move {
            let state = match s {
                RTCPeerConnectionState::New => NativeConnectionState::New,
                RTCPeerConnectionState::Connecting => NativeConnectionState::Connecting,
                RTCPeerConnectionState::Connected => NativeConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => NativeConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => NativeConnectionState::Failed,
                RTCPeerConnectionState::Closed => NativeConnectionState::Closed,
                _ => return,
            };
            debug!("Peer {} native state {:?}", sink.peer_id(), state);
            sink.emit(NativeEventKind::ConnectionState(state));
        })
    }));

    // channels opened by the remote side
    let sink = events.clone();
    let channels = Arc::clone(channels);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let sink = sink.clone();
        let channels = Arc::clone(&channels);
        Box::pin(async move {
            wire_data_channel(&dc, &sink);
            channels.lock().await.insert(dc.label().to_string(), dc);
        })
    }));
}

fn wire_data_channel(dc: &Arc<RTCDataChannel>, sink: &NativeEventSink) {
    let label = dc.label().to_string();

    let open_sink = sink.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        let sink = open_sink.clone();
        let label = open_label.clone();
        Box::pin(async move {
            sink.emit(NativeEventKind::DataChannelOpen { label });
        })
    }));

    let close_sink = sink.clone();
    let close_label = label.clone();
    dc.on_close(Box::new(move || {
        let sink = close_sink.clone();
        let label = close_label.clone();
        Box::pin(async move {
            sink.emit(NativeEventKind::DataChannelClose { label });
        })
    }));

    let message_sink = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = message_sink.clone();
        let label = label.clone();
        Box::pin(async move {
            sink.emit(NativeEventKind::DataChannelMessage {
                label,
                data: msg.data,
                is_text: msg.is_string,
            });
        })
    }));
}

/// One webrtc-rs peer connection plus its senders and data channels
pub struct RtcPeerConnection {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    events: NativeEventSink,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
    channels: DataChannels,
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(Error::Negotiation(
                "rollback descriptions are not supported".to_string(),
            ))
        }
    };
    result.map_err(|e| Error::Negotiation(format!("Invalid SDP: {}", e)))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => {
            return Err(Error::Negotiation(format!(
                "Unexpected SDP type: {}",
                other
            )))
        }
    };
    Ok(SessionDescription {
        sdp: description.sdp,
        sdp_type,
    })
}

#[async_trait]
impl NativePeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create offer: {}", e)))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to create answer: {}", e)))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<()> {
        let sender = self
            .pc
            .add_track(track.local() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to add track: {}", e)))?;

        // RTCP must be read for interceptors (NACK, reports) to run
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        debug!("Peer {} sending {:?} track {}", self.peer_id, track.kind(), track.id());
        self.senders.lock().await.insert(track.kind(), sender);
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Arc<MediaTrack>) -> Result<()> {
        let sender = self
            .senders
            .lock()
            .await
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::NoSender(format!("peer {} has no {:?} sender", self.peer_id, kind)))?;

        sender
            .replace_track(Some(track.local() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to replace track: {}", e)))
    }

    async fn create_data_channel(&self, label: &str, mode: DataChannelMode) -> Result<()> {
        let init = RTCDataChannelInit {
            ordered: Some(mode.ordered()),
            max_retransmits: mode.max_retransmits(),
            ..Default::default()
        };

        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| Error::DataChannel(format!("Failed to create data channel: {}", e)))?;

        wire_data_channel(&dc, &self.events);
        self.channels.lock().await.insert(label.to_string(), dc);
        Ok(())
    }

    async fn send_data(&self, label: &str, data: Bytes) -> Result<()> {
        let dc = self
            .channels
            .lock()
            .await
            .get(label)
            .cloned()
            .ok_or_else(|| Error::DataChannel(format!("no data channel {}", label)))?;

        dc.send(&data)
            .await
            .map(|_| ())
            .map_err(|e| Error::DataChannel(format!("Failed to send: {}", e)))
    }

    async fn get_stats(&self) -> Result<NativeStats> {
        let report = self.pc.get_stats().await;
        let mut stats = NativeStats::default();

        for entry in report.reports.values() {
            match entry {
                StatsReportType::RemoteInboundRTP(remote) => {
                    if let Some(rtt) = remote.round_trip_time {
                        stats.round_trip_time_ms = Some(rtt * 1000.0);
                    }
                    stats.packets_received += remote.packets_received;
                    stats.packets_lost += remote.packets_lost.max(0) as u64;
                }
                StatsReportType::InboundRTP(inbound) => {
                    stats.bytes_received += inbound.bytes_received;
                }
                StatsReportType::OutboundRTP(outbound) => {
                    stats.bytes_sent += outbound.bytes_sent;
                }
                _ => {}
            }
        }

        Ok(stats)
    }

    async fn close_data_channels(&self) -> Result<()> {
        let channels: Vec<_> = self.channels.lock().await.drain().collect();

        for (label, dc) in channels {
            if let Err(e) = dc.close().await {
                warn!("Failed to close data channel {} for {}: {}", label, self.peer_id, e);
            }
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection: {}", self.peer_id);

        self.pc
            .close()
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to close connection: {}", e)))
    }
}
