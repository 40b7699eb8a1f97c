use lazy_static::lazy_static;
use regex::{Captures, Regex};
use url::Url;

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

lazy_static! {
    static ref URI_ATTR: Regex = Regex::new(r#"URI="([^"]*)""#).unwrap();
}

// Tags whose URI attribute points at something the player will fetch.
const URI_TAGS: [&str; 4] = [
    "#EXT-X-KEY:",
    "#EXT-X-MAP:",
    "#EXT-X-MEDIA:",
    "#EXT-X-I-FRAME-STREAM-INF:",
];

/// Everything needed to turn a playlist entry back into a proxy request.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// Where the playlist was actually fetched from (after redirects).
    pub source: Url,
    pub deinterlace: bool,
    /// Host the client reached us on; `None` produces origin-relative links.
    pub host: Option<String>,
}

impl RewriteContext {
    pub fn proxy_url(&self, target: &str) -> String {
        let base = match self.host.as_deref() {
            Some(h) if h.contains("://") => h.trim_end_matches('/').to_string(),
            Some(h) => format!("http://{}", h.trim_end_matches('/')),
            None => String::new(),
        };
        let mut out = format!(
            "{base}/proxy?url={}&deint={}",
            urlencoding::encode(target),
            if self.deinterlace { 1 } else { 0 }
        );
        if let Some(h) = &self.host {
            out.push_str("&host=");
            out.push_str(&urlencoding::encode(h));
        }
        out
    }

    fn resolve(&self, reference: &str) -> Option<String> {
        self.source
            .join(reference)
            .ok()
            .map(|abs| self.proxy_url(abs.as_str()))
    }
}

/// Rewrites every media reference in `body` so the next fetch re-enters the
/// proxy. URI lines are resolved against the playlist's own URL; lines that do
/// not resolve are kept as they are. Comment lines stay untouched except for
/// the `URI="..."` attribute of key/map/media tags.
pub fn rewrite_playlist(body: &str, ctx: &RewriteContext) -> String {
    let mut out = String::with_capacity(body.len() * 2);
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            out.push_str(line);
        } else if trimmed.starts_with('#') {
            if URI_TAGS.iter().any(|tag| trimmed.starts_with(tag)) {
                let rewritten = URI_ATTR.replace_all(trimmed, |caps: &Captures| {
                    match ctx.resolve(&caps[1]) {
                        Some(proxied) => format!("URI=\"{proxied}\""),
                        None => caps[0].to_string(),
                    }
                });
                out.push_str(&rewritten);
            } else {
                out.push_str(line);
            }
        } else {
            match ctx.resolve(trimmed) {
                Some(proxied) => out.push_str(&proxied),
                None => out.push_str(line),
            }
        }
        out.push('\n');
    }
    out
}

pub fn is_playlist(content_type: &str, path: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    let path = path.to_ascii_lowercase();
    ct.contains("mpegurl") || path.ends_with(".m3u8") || path.ends_with(".m3u")
}

pub fn is_transport_stream(content_type: &str, path: &str) -> bool {
    content_type.to_ascii_lowercase().contains("mp2t") || path.to_ascii_lowercase().ends_with(".ts")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(source: &str) -> RewriteContext {
        RewriteContext {
            source: Url::parse(source).unwrap(),
            deinterlace: true,
            host: Some("10.0.0.2:3005".to_string()),
        }
    }

    fn decoded_url_param(line: &str) -> String {
        let parsed = Url::parse(line).unwrap();
        parsed
            .query_pairs()
            .find(|(k, _)| k == "url")
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[test]
    fn test_relative_segment_resolves_against_source() {
        let c = ctx("http://cdn.example.com/hls/chan/index.m3u8?token=abc");
        let body = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg_00001.ts\n";
        let out = rewrite_playlist(body, &c);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-TARGETDURATION:4");
        assert!(lines[3].starts_with("http://10.0.0.2:3005/proxy?url="));
        assert!(lines[3].contains("&deint=1"));
        assert!(lines[3].ends_with("&host=10.0.0.2%3A3005"));
        assert_eq!(
            decoded_url_param(lines[3]),
            "http://cdn.example.com/hls/chan/seg_00001.ts"
        );
    }

    #[test]
    fn test_absolute_and_root_relative_entries() {
        let c = ctx("http://a.example.com/live/u/p/1.m3u8");
        let body = "#EXTM3U\n/hls/x/seg.ts\nhttps://b.example.com/y.ts\n";
        let out = rewrite_playlist(body, &c);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(decoded_url_param(lines[1]), "http://a.example.com/hls/x/seg.ts");
        assert_eq!(decoded_url_param(lines[2]), "https://b.example.com/y.ts");
    }

    #[test]
    fn test_blank_lines_and_comments_pass_through() {
        let c = ctx("http://a.example.com/p.m3u8");
        let body = "#EXTM3U\n\n#EXT-X-VERSION:3\r\n";
        assert_eq!(rewrite_playlist(body, &c), "#EXTM3U\n\n#EXT-X-VERSION:3\n");
    }

    #[test]
    fn test_key_uri_is_proxied() {
        let c = ctx("http://a.example.com/hls/p.m3u8");
        let body = "#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x01\n";
        let out = rewrite_playlist(body, &c);
        assert!(out.starts_with("#EXT-X-KEY:METHOD=AES-128,URI=\"http://10.0.0.2:3005/proxy?url="));
        assert!(out.contains("http%3A%2F%2Fa.example.com%2Fhls%2Fkey.bin"));
        assert!(out.trim_end().ends_with(",IV=0x01"));
    }

    #[test]
    fn test_relative_links_without_host() {
        let c = RewriteContext {
            source: Url::parse("http://a.example.com/p.m3u8").unwrap(),
            deinterlace: false,
            host: None,
        };
        let out = rewrite_playlist("chunk.ts\n", &c);
        assert_eq!(
            out,
            "/proxy?url=http%3A%2F%2Fa.example.com%2Fchunk.ts&deint=0\n"
        );
    }

    #[test]
    fn test_content_classification() {
        assert!(is_playlist("application/vnd.apple.mpegurl", "/x"));
        assert!(is_playlist("Application/X-MpegURL; charset=utf-8", "/x"));
        assert!(is_playlist("text/plain", "/live/u/p/1.m3u8"));
        assert!(!is_playlist("video/mp2t", "/seg.ts"));
        assert!(is_transport_stream("video/MP2T", "/x"));
        assert!(is_transport_stream("application/octet-stream", "/live/u/p/1.ts"));
        assert!(!is_transport_stream("video/mp4", "/x.mp4"));
    }
}
