//! [`MediaEngine`] over an in-process `mediasoup` worker and router.
//!
//! mediasoup objects close when dropped, so closing an id here means
//! removing the object (and everything created on it) from the maps.

use super::{
    ConsumerInfo, EngineError, EngineEvent, MediaEngine, PlainTransportInfo, WebRtcTransportInfo,
    ENGINE_EVENT_CHANNEL_CAPACITY,
};
use crate::config::EngineConfig;
use common::types::{self, ConsumerId, MediaKind, ProducerId, TransportId};
use ::mediasoup::data_structures::{DtlsState, ListenInfo, Protocol};
use ::mediasoup::prelude::*;
use ::mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use signaling_protocol::{
    DtlsParameters as WireDtls, IceCandidates, IceParameters as WireIce,
    RtpCapabilities as WireCapabilities, RtpParameters as WireRtp,
};
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Router codecs: Opus audio and VP8 video.
fn media_codecs() -> Result<Vec<RtpCodecCapability>, EngineError> {
    from_json(json!([
        {
            "kind": "audio",
            "mimeType": "audio/opus",
            "clockRate": 48000,
            "channels": 2,
            "parameters": {},
            "rtcpFeedback": []
        },
        {
            "kind": "video",
            "mimeType": "video/VP8",
            "clockRate": 90000,
            "parameters": {"x-google-start-bitrate": 1000},
            "rtcpFeedback": []
        }
    ]))
}

fn from_json<T: DeserializeOwned>(value: Value) -> Result<T, EngineError> {
    serde_json::from_value(value).map_err(|e| EngineError::Rejected(format!("invalid parameters: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Rejected(format!("unserializable engine value: {e}")))
}

fn rejected(e: impl std::fmt::Display) -> EngineError {
    EngineError::Rejected(e.to_string())
}

fn unknown(kind: &'static str, id: &str) -> EngineError {
    EngineError::UnknownResource {
        kind,
        id: id.to_string(),
    }
}

#[derive(Clone)]
enum AnyTransport {
    WebRtc(WebRtcTransport),
    Plain(PlainTransport),
}

#[derive(Default)]
struct Objects {
    transports: HashMap<String, AnyTransport>,
    /// Producer and the transport it was created on.
    producers: HashMap<String, (Producer, String)>,
    consumers: HashMap<String, (Consumer, String)>,
}

pub struct MediasoupEngine {
    _worker_manager: WorkerManager,
    _worker: Worker,
    router: Router,
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    objects: Mutex<Objects>,
}

impl MediasoupEngine {
    /// Start a worker and a router with the service's codecs.
    ///
    /// # Errors
    ///
    /// `Unavailable` if the worker or router cannot be created.
    pub async fn start(config: EngineConfig) -> Result<Self, EngineError> {
        let worker_manager = WorkerManager::new();

        let mut settings = WorkerSettings::default();
        settings.log_level = WorkerLogLevel::Warn;
        settings.log_tags = vec![
            WorkerLogTag::Info,
            WorkerLogTag::Ice,
            WorkerLogTag::Dtls,
            WorkerLogTag::Rtp,
            WorkerLogTag::Srtp,
            WorkerLogTag::Rtcp,
        ];

        let worker = worker_manager
            .create_worker(settings)
            .await
            .map_err(|e| EngineError::Unavailable(format!("failed to create worker: {e}")))?;

        let (events, _) = broadcast::channel(ENGINE_EVENT_CHANNEL_CAPACITY);
        let dead_events = events.clone();
        worker
            .on_dead(move |reason| {
                let reason = format!("{reason:?}");
                error!(target: "sc.engine", reason = %reason, "mediasoup worker died");
                let _ = dead_events.send(EngineEvent::WorkerDied { reason });
            })
            .detach();

        let router = worker
            .create_router(RouterOptions::new(media_codecs()?))
            .await
            .map_err(|e| EngineError::Unavailable(format!("failed to create router: {e}")))?;

        info!(
            target: "sc.engine",
            worker_id = %worker.id(),
            router_id = %router.id(),
            "mediasoup router ready"
        );

        Ok(Self {
            _worker_manager: worker_manager,
            _worker: worker,
            router,
            config,
            events,
            objects: Mutex::new(Objects::default()),
        })
    }

    fn listen_info(&self) -> ListenInfo {
        ListenInfo {
            protocol: Protocol::Udp,
            ip: self.config.listen_ip,
            announced_address: self.config.announced_address.clone(),
            expose_internal_ip: false,
            port: None,
            port_range: Some(self.config.rtc_min_port..=self.config.rtc_max_port),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }

    fn webrtc_transport(&self, transport_id: &TransportId) -> Result<WebRtcTransport, EngineError> {
        match self.objects.lock().transports.get(transport_id.as_str()) {
            Some(AnyTransport::WebRtc(transport)) => Ok(transport.clone()),
            _ => Err(unknown("transport", transport_id.as_str())),
        }
    }

    fn plain_transport(&self, transport_id: &TransportId) -> Result<PlainTransport, EngineError> {
        match self.objects.lock().transports.get(transport_id.as_str()) {
            Some(AnyTransport::Plain(transport)) => Ok(transport.clone()),
            _ => Err(unknown("transport", transport_id.as_str())),
        }
    }

    fn producer(&self, producer_id: &ProducerId) -> Result<Producer, EngineError> {
        self.objects
            .lock()
            .producers
            .get(producer_id.as_str())
            .map(|(producer, _)| producer.clone())
            .ok_or_else(|| unknown("producer", producer_id.as_str()))
    }
}

#[async_trait::async_trait]
impl MediaEngine for MediasoupEngine {
    async fn rtp_capabilities(&self) -> Result<WireCapabilities, EngineError> {
        Ok(WireCapabilities(to_json(self.router.rtp_capabilities())?))
    }

    async fn create_webrtc_transport(&self) -> Result<WebRtcTransportInfo, EngineError> {
        let mut options =
            WebRtcTransportOptions::new(WebRtcTransportListenInfos::new(self.listen_info()));
        options.initial_available_outgoing_bitrate = self.config.initial_outgoing_bitrate;

        let transport = self
            .router
            .create_webrtc_transport(options)
            .await
            .map_err(rejected)?;
        if let Err(e) = transport
            .set_max_incoming_bitrate(self.config.max_incoming_bitrate)
            .await
        {
            warn!(target: "sc.engine", error = %e, "Failed to cap incoming bitrate");
        }

        let id = TransportId::from(transport.id().to_string());
        let events = self.events.clone();
        let closed_id = id.clone();
        transport
            .on_dtls_state_change(move |state| {
                if matches!(state, DtlsState::Failed | DtlsState::Closed) {
                    let _ = events.send(EngineEvent::TransportClosed {
                        transport_id: closed_id.clone(),
                    });
                }
            })
            .detach();

        let info = WebRtcTransportInfo {
            id: id.clone(),
            ice_parameters: WireIce(to_json(transport.ice_parameters())?),
            ice_candidates: IceCandidates(to_json(transport.ice_candidates())?),
            dtls_parameters: WireDtls(to_json(&transport.dtls_parameters())?),
        };
        self.objects
            .lock()
            .transports
            .insert(id.as_str().to_string(), AnyTransport::WebRtc(transport));
        Ok(info)
    }

    async fn connect_webrtc_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: WireDtls,
    ) -> Result<(), EngineError> {
        let transport = self.webrtc_transport(transport_id)?;
        let dtls_parameters = from_json(dtls_parameters.0)?;
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(rejected)
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: WireRtp,
    ) -> Result<ProducerId, EngineError> {
        let transport = self.webrtc_transport(transport_id)?;
        let kind = match kind {
            MediaKind::Audio => ::mediasoup::rtp_parameters::MediaKind::Audio,
            MediaKind::Video => ::mediasoup::rtp_parameters::MediaKind::Video,
        };
        let rtp_parameters = from_json(rtp_parameters.0)?;

        let producer = transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(rejected)?;

        let id = ProducerId::from(producer.id().to_string());
        self.objects.lock().producers.insert(
            id.as_str().to_string(),
            (producer, transport_id.as_str().to_string()),
        );
        Ok(id)
    }

    async fn can_consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &WireCapabilities,
    ) -> Result<bool, EngineError> {
        let producer = self.producer(producer_id)?;
        let Ok(capabilities) = from_json::<RtpCapabilities>(rtp_capabilities.0.clone()) else {
            return Ok(false);
        };
        Ok(self.router.can_consume(&producer.id(), &capabilities))
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: WireCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError> {
        let producer = self.producer(producer_id)?;
        let transport = self
            .objects
            .lock()
            .transports
            .get(transport_id.as_str())
            .cloned()
            .ok_or_else(|| unknown("transport", transport_id.as_str()))?;
        let capabilities = from_json(rtp_capabilities.0)?;

        let mut options = ConsumerOptions::new(producer.id(), capabilities);
        options.paused = paused;
        let consumer = match transport {
            AnyTransport::WebRtc(transport) => transport.consume(options).await,
            AnyTransport::Plain(transport) => transport.consume(options).await,
        }
        .map_err(rejected)?;

        let info = ConsumerInfo {
            id: ConsumerId::from(consumer.id().to_string()),
            producer_id: producer_id.clone(),
            kind: match consumer.kind() {
                ::mediasoup::rtp_parameters::MediaKind::Audio => types::MediaKind::Audio,
                ::mediasoup::rtp_parameters::MediaKind::Video => types::MediaKind::Video,
            },
            rtp_parameters: WireRtp(to_json(consumer.rtp_parameters())?),
        };
        self.objects.lock().consumers.insert(
            info.id.as_str().to_string(),
            (consumer, transport_id.as_str().to_string()),
        );
        Ok(info)
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        let consumer = self
            .objects
            .lock()
            .consumers
            .get(consumer_id.as_str())
            .map(|(consumer, _)| consumer.clone())
            .ok_or_else(|| unknown("consumer", consumer_id.as_str()))?;
        consumer.resume().await.map_err(rejected)
    }

    async fn create_plain_transport(&self) -> Result<PlainTransportInfo, EngineError> {
        let mut listen_info = self.listen_info();
        listen_info.ip = IpAddr::from([127, 0, 0, 1]);
        listen_info.announced_address = None;
        let mut options = PlainTransportOptions::new(listen_info);
        options.rtcp_mux = false;
        options.comedia = false;

        let transport = self
            .router
            .create_plain_transport(options)
            .await
            .map_err(rejected)?;

        let info = PlainTransportInfo {
            id: TransportId::from(transport.id().to_string()),
            local_port: transport.tuple().local_port(),
            local_rtcp_port: transport.rtcp_tuple().map(|tuple| tuple.local_port()),
        };
        self.objects
            .lock()
            .transports
            .insert(info.id.as_str().to_string(), AnyTransport::Plain(transport));
        Ok(info)
    }

    async fn connect_plain_transport(
        &self,
        transport_id: &TransportId,
        ip: IpAddr,
        port: u16,
        rtcp_port: Option<u16>,
    ) -> Result<(), EngineError> {
        let transport = self.plain_transport(transport_id)?;
        transport
            .connect(PlainTransportRemoteParameters {
                ip: Some(ip),
                port: Some(port),
                rtcp_port,
                srtp_parameters: None,
            })
            .await
            .map_err(rejected)
    }

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), EngineError> {
        let key = transport_id.as_str();
        let mut objects = self.objects.lock();
        let removed = objects.transports.remove(key);
        objects.producers.retain(|_, (_, owner)| owner != key);
        objects.consumers.retain(|_, (_, owner)| owner != key);
        removed
            .map(|_| ())
            .ok_or_else(|| unknown("transport", key))
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError> {
        self.objects
            .lock()
            .producers
            .remove(producer_id.as_str())
            .map(|_| ())
            .ok_or_else(|| unknown("producer", producer_id.as_str()))
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        self.objects
            .lock()
            .consumers
            .remove(consumer_id.as_str())
            .map(|_| ())
            .ok_or_else(|| unknown("consumer", consumer_id.as_str()))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}
