use std::time::Duration;

use serde::Serialize;

use super::PlayerConfig;
use crate::catalog::StreamFormat;

/// One candidate way to fetch and decode a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryAttempt {
    pub source_format: StreamFormat,
    pub play_as: StreamFormat,
    pub via_proxy: bool,
    pub via_transcode: bool,
}

impl DeliveryAttempt {
    const fn new(source: StreamFormat, play_as: StreamFormat, proxy: bool, transcode: bool) -> Self {
        Self {
            source_format: source,
            play_as,
            via_proxy: proxy,
            via_transcode: transcode,
        }
    }

    /// e.g. `M3U8`, `M3U8 + Proxy`, `TS + FFMPEG`
    pub fn label(&self) -> String {
        let mut label = self.play_as.extension().to_ascii_uppercase();
        if self.via_proxy {
            label.push_str(" + Proxy");
        }
        if self.via_transcode {
            label.push_str(" + FFMPEG");
        }
        label
    }
}

/// Ordered attempts for a preferred format. The first entry is always the
/// direct one in the original format.
pub fn attempt_sequence(preferred: StreamFormat, use_proxy: bool) -> Vec<DeliveryAttempt> {
    use StreamFormat::{Segmented as Seg, TransportStream as Ts};

    let order = match preferred {
        Ts => vec![
            DeliveryAttempt::new(Ts, Ts, false, false),
            DeliveryAttempt::new(Ts, Ts, true, false),
        ],
        Seg => vec![
            DeliveryAttempt::new(Seg, Seg, false, false),
            DeliveryAttempt::new(Seg, Seg, true, false),
            DeliveryAttempt::new(Seg, Ts, false, true),
        ],
    };

    if use_proxy {
        order
    } else {
        // Transcoding runs on the proxy server too.
        order
            .into_iter()
            .filter(|a| !a.via_proxy && !a.via_transcode)
            .collect()
    }
}

/// Pause before issuing the request for `attempts[index]`. Going from a
/// direct to a proxied attempt waits much longer: providers that limit
/// concurrent sessions per account reject the proxied request until the
/// direct session has been torn down on their side.
pub fn settle_delay(config: &PlayerConfig, attempts: &[DeliveryAttempt], index: usize) -> Duration {
    let prev = index.checked_sub(1).and_then(|i| attempts.get(i));
    let crossing = match (prev, attempts.get(index)) {
        (Some(prev), Some(next)) => next.via_proxy && !prev.via_proxy,
        _ => false,
    };

    let ms = if crossing {
        config.proxy_switch_settle_ms
    } else if index == 0 {
        config.first_settle_ms
    } else {
        config.settle_ms
    };
    Duration::from_millis(ms)
}
