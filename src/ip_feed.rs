//! Regional-registry delegation feed (`registry|cc|type|start|value|extra`).

use std::io;

use futures::TryStreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::ip_range::{RangeTable, SharedRangeTable};

/// Converts one data line into a CIDR when it belongs to `country_code`.
pub fn parse_feed_line(line: &str, country_code: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let parts: Vec<&str> = line.splitn(6, '|').collect();
    if parts.len() != 6 {
        return None;
    }

    let (cc, typ, start, value) = (parts[1], parts[2], parts[3], parts[4]);
    if cc != country_code {
        return None;
    }

    let prefix = match typ {
        "ipv4" => ipv4_prefix_from_host_count(value.parse().ok()?)?,
        "ipv6" => value.parse::<u32>().ok().filter(|p| *p <= 128)?,
        _ => return None,
    };
    Some(format!("{}/{}", start, prefix))
}

/// `32 - log2(count)`, defined only for exact powers of two.
fn ipv4_prefix_from_host_count(count: u64) -> Option<u32> {
    if !count.is_power_of_two() || count > 1 << 32 {
        return None;
    }
    Some(32 - count.trailing_zeros())
}

/// Streams the feed and builds a table of the matching ranges plus `seed`.
///
/// Returns `Ok(None)` when `cancel` fires before the stream is exhausted.
pub async fn load_table<R>(
    reader: R,
    country_code: &str,
    seed: &[String],
    cancel: &CancellationToken,
) -> Result<Option<RangeTable>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut cidrs = Vec::new();

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            line = lines.next_line() => line.map_err(|e| Error::FeedParse(e.to_string()))?,
        };
        match line {
            Some(line) => cidrs.extend(parse_feed_line(&line, country_code)),
            None => break,
        }
    }

    if cidrs.is_empty() {
        return Err(Error::EmptyFeed);
    }
    cidrs.extend(seed.iter().cloned());
    RangeTable::build(cidrs).map(Some)
}

/// Remote delegation feed for one country.
pub struct RangeFeed {
    client: reqwest::Client,
    url: String,
    country_code: String,
    seed: Vec<String>,
}

impl RangeFeed {
    pub fn new(client: reqwest::Client, url: String, country_code: String, seed: Vec<String>) -> Self {
        Self {
            client,
            url,
            country_code,
            seed,
        }
    }

    pub async fn fetch(&self, cancel: &CancellationToken) -> Result<Option<RangeTable>> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            res = self.client.get(&self.url).send() => res?.error_for_status()?,
        };

        let body = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        load_table(StreamReader::new(body), &self.country_code, &self.seed, cancel).await
    }

    /// Fetches and swaps in a new table. `Ok(false)` means cancelled; the
    /// live table is untouched on cancellation and on every error.
    pub async fn refresh(&self, table: &SharedRangeTable, cancel: &CancellationToken) -> Result<bool> {
        match self.fetch(cancel).await? {
            Some(fresh) => {
                tracing::info!(ranges = fresh.len(), country = %self.country_code, "ip range table refreshed");
                table.replace(fresh);
                Ok(true)
            }
            None => {
                tracing::debug!("ip range refresh cancelled");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = "\
2|apnic|20230101|3|19830613|20230101|+1000
# comment line
apnic|*|ipv4|*|3|summary
apnic|CN|ipv4|1.0.1.0|256|20110414|allocated
apnic|CN|ipv4|1.0.8.0|2048|20110412|allocated
apnic|JP|ipv4|1.0.16.0|4096|20110412|allocated
apnic|CN|ipv4|1.0.32.0|300|20110412|allocated
apnic|CN|ipv6|2001:da8::|32|20000101|allocated
apnic|CN|asn|4134|1|20020101|allocated
";

    #[test]
    fn test_parse_feed_line() {
        assert_eq!(
            parse_feed_line("apnic|CN|ipv4|1.0.1.0|256|20110414|allocated", "CN").as_deref(),
            Some("1.0.1.0/24")
        );
        assert_eq!(
            parse_feed_line("apnic|CN|ipv6|2001:da8::|32|20000101|allocated", "CN").as_deref(),
            Some("2001:da8::/32")
        );
        assert_eq!(parse_feed_line("apnic|CN|ipv4|1.0.1.0|1|x|allocated", "CN").as_deref(), Some("1.0.1.0/32"));
        assert_eq!(parse_feed_line("apnic|JP|ipv4|1.0.16.0|4096|x|y", "CN"), None);
        assert_eq!(parse_feed_line("apnic|CN|ipv4|1.0.32.0|300|x|y", "CN"), None);
        assert_eq!(parse_feed_line("apnic|CN|ipv4|1.0.32.0|many|x|y", "CN"), None);
        assert_eq!(parse_feed_line("# apnic|CN|ipv4|1.0.1.0|256|x|y", "CN"), None);
        assert_eq!(parse_feed_line("apnic|CN|ipv4", "CN"), None);
    }

    #[tokio::test]
    async fn test_load_table_filters_country() {
        let cancel = CancellationToken::new();
        let table = load_table(FEED.as_bytes(), "CN", &[], &cancel).await.unwrap().unwrap();

        assert_eq!(table.len(), 3);
        assert!(table.contains_host("1.0.1.5"));
        assert!(!table.contains_host("1.0.2.5"));
        assert!(table.contains_host("1.0.15.1"));
        assert!(!table.contains_host("1.0.16.1"));
        assert!(table.contains_host("2001:da8:1001:7::88"));
    }

    #[tokio::test]
    async fn test_seed_is_merged() {
        let cancel = CancellationToken::new();
        let seed = vec!["203.0.113.0/24".to_string()];
        let table = load_table(FEED.as_bytes(), "CN", &seed, &cancel).await.unwrap().unwrap();
        assert!(table.contains_host("203.0.113.9"));
    }

    #[tokio::test]
    async fn test_empty_feed_is_an_error() {
        let cancel = CancellationToken::new();
        let seed = vec!["203.0.113.0/24".to_string()];
        let err = load_table(FEED.as_bytes(), "KR", &seed, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::EmptyFeed));
    }

    #[tokio::test]
    async fn test_cancelled_load_returns_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = load_table(FEED.as_bytes(), "CN", &[], &cancel).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_live_table() {
        let live = SharedRangeTable::new(RangeTable::build(["1.0.1.0/24"]).unwrap());
        let feed = RangeFeed::new(
            reqwest::Client::new(),
            // nothing listens on port 9 of the loopback interface
            "http://127.0.0.1:9/delegated".to_string(),
            "CN".to_string(),
            Vec::new(),
        );
        let cancel = CancellationToken::new();

        assert!(feed.refresh(&live, &cancel).await.is_err());
        assert!(live.contains_host("1.0.1.1"));
    }

    #[tokio::test]
    async fn test_cancelled_refresh_keeps_live_table() {
        let live = SharedRangeTable::new(RangeTable::build(["1.0.1.0/24"]).unwrap());
        let feed = RangeFeed::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/delegated".to_string(),
            "CN".to_string(),
            Vec::new(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!feed.refresh(&live, &cancel).await.unwrap());
        assert!(live.contains_host("1.0.1.1"));
    }
}
