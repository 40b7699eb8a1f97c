use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Container format a provider serves a live channel in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    #[default]
    Segmented,
    TransportStream,
}

impl StreamFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            StreamFormat::Segmented => "m3u8",
            StreamFormat::TransportStream => "ts",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "m3u8" | "m3u" => Some(StreamFormat::Segmented),
            "ts" => Some(StreamFormat::TransportStream),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: String,
    pub display_name: String,
    pub preferred_format: StreamFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    pub format: StreamFormat,
}

impl ProviderConfig {
    pub fn is_complete(&self) -> bool {
        !self.server.trim().is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }

    /// `<server>/live/<user>/<pass>/<id>.<ext>`
    pub fn live_url(&self, stream_id: &str, format: StreamFormat) -> String {
        format!(
            "{}/live/{}/{}/{}.{}",
            normalize_server(&self.server),
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            urlencoding::encode(stream_id),
            format.extension()
        )
    }
}

/// Adds `http://` when no scheme is given and strips trailing slashes.
pub fn normalize_server(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let lower = trimmed.to_ascii_lowercase();
    let with_scheme = if lower.starts_with("http://") || lower.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    with_scheme.trim_end_matches('/').to_string()
}

// Providers are inconsistent about numbers vs strings for ids.
fn value_as_string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct XtreamClient {
    http: reqwest::Client,
    provider: ProviderConfig,
}

impl XtreamClient {
    pub fn new(http: reqwest::Client, provider: ProviderConfig) -> Self {
        Self { http, provider }
    }

    fn api_url(&self, params: &[(&str, &str)]) -> Result<url::Url> {
        let base = format!("{}/player_api.php", normalize_server(&self.provider.server));
        let mut url = url::Url::parse(&base).with_context(|| format!("invalid provider server {base}"))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("username", &self.provider.username);
            q.append_pair("password", &self.provider.password);
            for (k, v) in params {
                q.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn get_json(&self, params: &[(&str, &str)]) -> Result<Value> {
        let url = self.api_url(params)?;
        debug!("Provider request: action={:?}", params.first().map(|(_, v)| *v));
        let resp = self.http.get(url).send().await.context("provider request failed")?;
        let status = resp.status();
        if !status.is_success() {
            bail!("provider returned HTTP {}", status.as_u16());
        }
        let text = resp.text().await.context("failed to read provider response")?;
        serde_json::from_str(&text).context("provider response is not JSON")
    }

    /// The single credential check: `user_info.auth` must be truthy.
    pub async fn authenticate(&self) -> Result<()> {
        let body = self.get_json(&[]).await?;
        let auth = body.get("user_info").and_then(|u| u.get("auth"));
        let ok = match auth {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            Some(Value::String(s)) => s != "0" && !s.is_empty(),
            _ => false,
        };
        if !ok {
            bail!("Auth failed");
        }
        info!("Provider authenticated: server={}", normalize_server(&self.provider.server));
        Ok(())
    }

    pub async fn live_categories(&self) -> Result<Vec<Category>> {
        let body = self.get_json(&[("action", "get_live_categories")]).await?;
        Ok(categories_from_json(&body))
    }

    pub async fn live_streams(&self, category_id: Option<&str>) -> Result<Vec<ChannelRef>> {
        let body = match category_id {
            Some(id) => {
                self.get_json(&[("action", "get_live_streams"), ("category_id", id)])
                    .await?
            }
            None => self.get_json(&[("action", "get_live_streams")]).await?,
        };
        Ok(streams_from_json(&body, self.provider.format))
    }
}

/// Categories ordered by numeric id; non-numeric ids sort last.
pub fn categories_from_json(body: &Value) -> Vec<Category> {
    let mut out: Vec<Category> = body
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(Category {
                        id: value_as_string(item.get("category_id"))?,
                        name: value_as_string(item.get("category_name")).unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    out.sort_by_key(|c| c.id.parse::<i64>().unwrap_or(i64::MAX));
    out
}

/// Live streams ordered by name.
pub fn streams_from_json(body: &Value, format: StreamFormat) -> Vec<ChannelRef> {
    let mut out: Vec<ChannelRef> = body
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(ChannelRef {
                        id: value_as_string(item.get("stream_id"))?,
                        display_name: value_as_string(item.get("name")).unwrap_or_default(),
                        preferred_format: format,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    out.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    out
}

lazy_static! {
    static ref RE_EXTINF: Regex = Regex::new(r"^#EXTINF:[^,]*,(.*)$").unwrap();
    static ref RE_LIVE_ID: Regex = Regex::new(r"/live/[^/]+/[^/]+/([^/.?]+)\.([A-Za-z0-9]+)").unwrap();
}

/// Parses an `m3u_plus` playlist into channels. Only entries whose URL has the
/// provider live shape yield a channel; the stream id and format come from
/// the URL.
pub fn parse_m3u(content: &str) -> Vec<ChannelRef> {
    let mut channels = Vec::new();
    let mut current_name = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = RE_EXTINF.captures(line) {
            current_name = Some(caps[1].trim().to_string());
        } else if !line.starts_with('#') {
            let name = current_name.take();
            let Some(caps) = RE_LIVE_ID.captures(line) else { continue };
            let Some(format) = StreamFormat::from_extension(&caps[2]) else { continue };
            channels.push(ChannelRef {
                id: caps[1].to_string(),
                display_name: name.unwrap_or_else(|| caps[1].to_string()),
                preferred_format: format,
            });
        }
    }

    channels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_server() {
        assert_eq!(normalize_server("  example.com:8080/ "), "http://example.com:8080");
        assert_eq!(normalize_server("https://x.tv///"), "https://x.tv");
        assert_eq!(normalize_server("HTTP://x.tv"), "HTTP://x.tv");
        assert_eq!(normalize_server(""), "");
    }

    #[test]
    fn test_live_url() {
        let p = ProviderConfig {
            server: "prov.example:80/".into(),
            username: "u".into(),
            password: "p".into(),
            format: StreamFormat::Segmented,
        };
        assert_eq!(
            p.live_url("1234", StreamFormat::TransportStream),
            "http://prov.example:80/live/u/p/1234.ts"
        );
    }

    #[test]
    fn test_parse_m3u() {
        let data = r#"#EXTM3U
#EXTINF:-1 tvg-id="a.al" tvg-name="News HD" group-title="NEWS",News HD
http://prov.example/live/u/p/101.ts
#EXTINF:-1 tvg-id="" group-title="MOVIES",Some Film
http://prov.example/movie/u/p/5.mkv
#EXTINF:0,Sport
http://prov.example/live/u/p/202.m3u8"#;

        let channels = parse_m3u(data);
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].display_name, "News HD");
        assert_eq!(channels[0].id, "101");
        assert_eq!(channels[0].preferred_format, StreamFormat::TransportStream);
        assert_eq!(channels[1].display_name, "Sport");
        assert_eq!(channels[1].preferred_format, StreamFormat::Segmented);
    }

    #[test]
    fn test_categories_and_streams_are_sorted() {
        let cats: Value = serde_json::json!([
            {"category_id": "10", "category_name": "B"},
            {"category_id": 2, "category_name": "A"},
            {"category_name": "no id"}
        ]);
        let cats = categories_from_json(&cats);
        assert_eq!(cats.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["2", "10"]);

        let streams: Value = serde_json::json!([
            {"stream_id": 7, "name": "Zeta"},
            {"stream_id": "8", "name": "Alpha"}
        ]);
        let streams = streams_from_json(&streams, StreamFormat::Segmented);
        assert_eq!(streams[0].display_name, "Alpha");
        assert_eq!(streams[0].id, "8");
        assert_eq!(streams[1].id, "7");
    }

    #[test]
    fn test_non_array_body_yields_nothing() {
        assert!(categories_from_json(&serde_json::json!({"user_info": {}})).is_empty());
    }
}
