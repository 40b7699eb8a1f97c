use super::DeliveryAttempt;
use crate::catalog::{ChannelRef, ProviderConfig};

/// Builds attempt URLs locally; there is no RPC to the delivery server.
#[derive(Debug, Clone)]
pub struct DeliveryUrls {
    provider: ProviderConfig,
    backend_base: String,
}

impl DeliveryUrls {
    pub fn new(provider: ProviderConfig, backend_base: &str) -> Self {
        Self {
            provider,
            backend_base: backend_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn direct(&self, channel: &ChannelRef, attempt: &DeliveryAttempt) -> String {
        self.provider.live_url(&channel.id, attempt.source_format)
    }

    pub fn proxy(&self, direct: &str) -> String {
        format!("{}/proxy?url={}&deint=1", self.backend_base, urlencoding::encode(direct))
    }

    pub fn transcode(&self, direct: &str) -> String {
        format!("{}/proxy-transcode?url={}", self.backend_base, urlencoding::encode(direct))
    }

    pub fn for_attempt(&self, channel: &ChannelRef, attempt: &DeliveryAttempt) -> String {
        let direct = self.direct(channel, attempt);
        if attempt.via_transcode {
            self.transcode(&direct)
        } else if attempt.via_proxy {
            self.proxy(&direct)
        } else {
            direct
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StreamFormat;
    use crate::player::attempt_sequence;

    #[test]
    fn test_urls_per_attempt() {
        let urls = DeliveryUrls::new(
            ProviderConfig {
                server: "prov.example".into(),
                username: "me".into(),
                password: "s3cret".into(),
                format: StreamFormat::Segmented,
            },
            "http://10.0.0.2:3005/",
        );
        let ch = ChannelRef {
            id: "42".into(),
            display_name: "News".into(),
            preferred_format: StreamFormat::Segmented,
        };
        let seq = attempt_sequence(StreamFormat::Segmented, true);

        assert_eq!(urls.for_attempt(&ch, &seq[0]), "http://prov.example/live/me/s3cret/42.m3u8");
        assert_eq!(
            urls.for_attempt(&ch, &seq[1]),
            "http://10.0.0.2:3005/proxy?url=http%3A%2F%2Fprov.example%2Flive%2Fme%2Fs3cret%2F42.m3u8&deint=1"
        );
        assert_eq!(
            urls.for_attempt(&ch, &seq[2]),
            "http://10.0.0.2:3005/proxy-transcode?url=http%3A%2F%2Fprov.example%2Flive%2Fme%2Fs3cret%2F42.m3u8"
        );
    }
}
