#![forbid(unsafe_code)]

// Configuration for mediasoup workers, routers, and transports

use crate::media::types::{MediaError, MediaResult};
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};
use std::str::FromStr;
use tracing::warn;

/// Sampling interval of the per-room active speaker observer
pub const ACTIVE_SPEAKER_INTERVAL_MS: u16 = 300;

/// Main media server configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub webrtc_transport_config: WebRtcTransportConfig,
}

impl MediaConfig {
    /// Builds the configuration from environment variables, falling back to defaults
    pub fn from_env() -> MediaResult<Self> {
        let mut config = Self::default();

        let worker = &mut config.worker_config;
        worker.num_workers = env_or("NUM_WORKERS", worker.num_workers).max(1);
        worker.rtc_min_port = env_or("RTC_MIN_PORT", worker.rtc_min_port);
        worker.rtc_max_port = env_or("RTC_MAX_PORT", worker.rtc_max_port);
        if worker.rtc_min_port > worker.rtc_max_port {
            return Err(MediaError::Config(format!(
                "RTC_MIN_PORT ({}) is greater than RTC_MAX_PORT ({})",
                worker.rtc_min_port, worker.rtc_max_port
            )));
        }
        if let Ok(level) = std::env::var("MEDIASOUP_LOG_LEVEL") {
            worker.log_level = parse_log_level(&level)?;
        }

        let transport = &mut config.webrtc_transport_config;
        if let Ok(ip) = std::env::var("LISTEN_IP") {
            transport.listen_ip = ip
                .parse()
                .map_err(|_| MediaError::Config(format!("Invalid LISTEN_IP: {ip}")))?;
        }
        if let Ok(ip) = std::env::var("ANNOUNCE_IP") {
            let addr: IpAddr = ip
                .parse()
                .map_err(|_| MediaError::Config(format!("Invalid ANNOUNCE_IP: {ip}")))?;
            transport.announce_ip(addr);
        }
        transport.enable_udp = env_or("ENABLE_UDP", transport.enable_udp);
        transport.enable_tcp = env_or("ENABLE_TCP", transport.enable_tcp);
        transport.prefer_udp = env_or("PREFER_UDP", transport.prefer_udp);
        transport.prefer_tcp = env_or("PREFER_TCP", transport.prefer_tcp);
        transport.initial_available_outgoing_bitrate = env_or(
            "INITIAL_OUTGOING_BITRATE",
            transport.initial_available_outgoing_bitrate,
        );
        transport.max_incoming_bitrate = std::env::var("MAX_INCOMING_BITRATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(transport.max_incoming_bitrate);
        transport.rtc_port_range = Some(worker_port_range(&config.worker_config));

        if !config.webrtc_transport_config.enable_udp && !config.webrtc_transport_config.enable_tcp {
            return Err(MediaError::Config(
                "At least one of ENABLE_UDP / ENABLE_TCP must be true".to_string(),
            ));
        }

        Ok(config)
    }
}

fn worker_port_range(worker: &WorkerConfig) -> std::ops::RangeInclusive<u16> {
    worker.rtc_min_port..=worker.rtc_max_port
}

/// Reads and parses an environment variable, logging and ignoring bad values
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid value for {}: {:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_log_level(level: &str) -> MediaResult<WorkerLogLevel> {
    match level.to_ascii_lowercase().as_str() {
        "debug" => Ok(WorkerLogLevel::Debug),
        "warn" => Ok(WorkerLogLevel::Warn),
        "error" => Ok(WorkerLogLevel::Error),
        "none" => Ok(WorkerLogLevel::None),
        other => Err(MediaError::Config(format!(
            "Invalid MEDIASOUP_LOG_LEVEL: {other}"
        ))),
    }
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Srtp,
                WorkerLogTag::Rtcp,
            ],
            rtc_min_port: 40000,
            rtc_max_port: 41000,
        }
    }
}

impl WorkerConfig {
    /// Converts to mediasoup WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();

        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;

        settings
    }
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
    pub active_speaker_interval_ms: u16,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
            active_speaker_interval_ms: ACTIVE_SPEAKER_INTERVAL_MS,
        }
    }
}

impl RouterConfig {
    /// One audio codec (Opus) and two video alternatives (H264, VP8)
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::H264,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("packetization-mode", 1_u32.into()),
                    ("profile-level-id", "42e01f".into()),
                    ("level-asymmetry-allowed", 1_u32.into()),
                ]),
                rtcp_feedback: vec![],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![],
            },
        ]
    }

    /// Converts to RouterOptions for mediasoup
    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub rtc_port_range: Option<std::ops::RangeInclusive<u16>>,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: Option<u32>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub prefer_tcp: bool,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            announced_address: None,
            rtc_port_range: None,
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            prefer_tcp: false,
        }
    }
}

impl WebRtcTransportConfig {
    /// Advertises `public_ip` in ICE candidates instead of the listen address
    pub fn announce_ip(&mut self, public_ip: IpAddr) {
        self.announced_address = Some(public_ip.to_string());
    }

    fn listen_info(&self, protocol: Protocol) -> ListenInfo {
        ListenInfo {
            protocol,
            ip: self.listen_ip,
            announced_address: self.announced_address.clone(),
            port: None,
            port_range: self.rtc_port_range.clone(),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        }
    }

    /// Enabled protocols, most preferred first
    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols = Vec::with_capacity(2);
        if self.enable_udp {
            protocols.push(Protocol::Udp);
        }
        if self.enable_tcp {
            protocols.push(Protocol::Tcp);
        }
        if self.prefer_tcp && !self.prefer_udp {
            protocols.reverse();
        }
        protocols
    }

    /// Converts to WebRtcTransportOptions
    pub fn to_transport_options(&self) -> MediaResult<WebRtcTransportOptions> {
        let mut protocols = self.protocols().into_iter();
        let first = protocols.next().ok_or_else(|| {
            MediaError::Config("No transport protocol enabled".to_string())
        })?;

        let mut listen_infos = WebRtcTransportListenInfos::new(self.listen_info(first));
        for protocol in protocols {
            listen_infos = listen_infos.insert(self.listen_info(protocol));
        }

        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.initial_available_outgoing_bitrate = self.initial_available_outgoing_bitrate;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codecs_are_one_audio_and_two_video() {
        let codecs = RouterConfig::default_codecs();
        let audio = codecs
            .iter()
            .filter(|c| matches!(c, RtpCodecCapability::Audio { .. }))
            .count();
        let video = codecs
            .iter()
            .filter(|c| matches!(c, RtpCodecCapability::Video { .. }))
            .count();
        assert_eq!(audio, 1);
        assert_eq!(video, 2);
        assert_eq!(RouterConfig::default().active_speaker_interval_ms, 300);
    }

    #[test]
    fn udp_preferred_by_default() {
        let config = WebRtcTransportConfig::default();
        assert_eq!(config.protocols(), vec![Protocol::Udp, Protocol::Tcp]);
    }

    #[test]
    fn tcp_preference_reorders_protocols() {
        let config = WebRtcTransportConfig {
            prefer_udp: false,
            prefer_tcp: true,
            ..WebRtcTransportConfig::default()
        };
        assert_eq!(config.protocols(), vec![Protocol::Tcp, Protocol::Udp]);
    }

    #[test]
    fn no_protocol_is_a_configuration_error() {
        let config = WebRtcTransportConfig {
            enable_udp: false,
            enable_tcp: false,
            ..WebRtcTransportConfig::default()
        };
        assert!(matches!(
            config.to_transport_options(),
            Err(MediaError::Config(_))
        ));
    }

    #[test]
    fn public_ip_is_announced() {
        let mut config = WebRtcTransportConfig::default();
        config.announce_ip("203.0.113.7".parse().unwrap());
        assert_eq!(config.announced_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(
            config.listen_info(Protocol::Tcp).announced_address.as_deref(),
            Some("203.0.113.7")
        );
    }

    #[test]
    fn log_level_parsing() {
        assert!(matches!(parse_log_level("WARN"), Ok(WorkerLogLevel::Warn)));
        assert!(parse_log_level("loud").is_err());
    }
}
