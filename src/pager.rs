//! Feed pagination. [`WindowedPager`] issues one request per planned date
//! window; [`LinkFollowingPager`] walks server-provided continuation links.
use crate::atom;
use crate::feed::{ensure_json_format, FeedTransport};
use crate::model::{FieldValue, Record};
use crate::schema::EntityType;
use crate::windows::DateWindow;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const RETRY_ATTEMPTS: usize = 20;
pub const RETRY_PAUSE: Duration = Duration::from_secs(60);

pub const START_PLACEHOLDER: &str = "#STARTDATE#";
pub const FINISH_PLACEHOLDER: &str = "#FINISHDATE#";

/// Page-size hint appended to continuation requests.
const PAGE_SIZE_HINT: &str = "&$top=1000";

/// Response body shape the windowed feed serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Json,
    Markup,
}

/// Substitute a window's bounds into a request template.
pub fn window_url(template: &str, window: &DateWindow) -> String {
    template
        .replace(START_PLACEHOLDER, &window.start_stamp())
        .replace(FINISH_PLACEHOLDER, &window.end_stamp())
}

fn record_from_json(object: &serde_json::Map<String, Value>) -> Record {
    let mut record = Record::new();
    for (name, value) in object {
        match value {
            Value::Array(items) => {
                let rows = items
                    .iter()
                    .filter_map(|item| item.as_object().map(record_from_json))
                    .collect();
                record.insert(name.clone(), FieldValue::Rows(rows));
            }
            scalar => record.insert(name.clone(), FieldValue::Scalar(scalar.clone())),
        }
    }
    record
}

/// Parse a JSON envelope (`{"value": [...]}`) into records.
fn parse_json_envelope(body: &str) -> anyhow::Result<Vec<Record>> {
    let root: Value = serde_json::from_str(body)?;
    let records = root
        .get("value")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_object().map(record_from_json))
                .collect()
        })
        .unwrap_or_default();
    Ok(records)
}

/// One request per date window, with bounded retry per request.
pub struct WindowedPager<'a> {
    transport: &'a dyn FeedTransport,
    format: FeedFormat,
    retry_pause: Duration,
}

impl<'a> WindowedPager<'a> {
    pub fn new(transport: &'a dyn FeedTransport, format: FeedFormat) -> Self {
        Self {
            transport,
            format,
            retry_pause: RETRY_PAUSE,
        }
    }

    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    /// Fetch one request URL and normalize the response. Returns `None`
    /// after retries are exhausted; the caller skips the window.
    pub async fn fetch(&self, url: &str) -> Option<Vec<Record>> {
        let url = match self.format {
            FeedFormat::Json => ensure_json_format(url),
            FeedFormat::Markup => url.to_string(),
        };

        for attempt in 1..=RETRY_ATTEMPTS {
            match self.attempt(&url).await {
                Ok(records) => return Some(records),
                Err(err) => {
                    debug!(%url, attempt, %err, "feed request attempt failed");
                    tokio::time::sleep(self.retry_pause).await;
                }
            }
        }
        error!(%url, "cannot get data after {RETRY_ATTEMPTS} attempts");
        None
    }

    async fn attempt(&self, url: &str) -> anyhow::Result<Vec<Record>> {
        let response = self.transport.get(url).await?;
        if !response.is_ok() {
            anyhow::bail!("feed returned status {}", response.status);
        }
        match self.format {
            FeedFormat::Json => parse_json_envelope(&response.body),
            FeedFormat::Markup => atom::parse_entries(&response.body),
        }
    }
}

/// Link-following pager state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagerState {
    HasMore { url: String, first_page: bool },
    Done,
}

/// Result of one pager step.
#[derive(Debug)]
pub enum PageStep {
    /// A page was fetched; `inferred` carries the first page's schema.
    Page {
        records: Vec<Record>,
        inferred: Option<EntityType>,
    },
    /// Transient failure; state is unchanged and the caller should pause
    /// before stepping again.
    Retry,
    Finished,
}

/// Walks `rel=next` continuation links until the feed stops providing one,
/// deriving the schema opportunistically from the first page.
pub struct LinkFollowingPager<'a> {
    transport: &'a dyn FeedTransport,
    entity_name: String,
    state: PagerState,
}

impl<'a> LinkFollowingPager<'a> {
    pub fn new(transport: &'a dyn FeedTransport, entity_name: &str, start_url: &str) -> Self {
        Self {
            transport,
            entity_name: entity_name.to_string(),
            state: PagerState::HasMore {
                url: start_url.to_string(),
                first_page: true,
            },
        }
    }

    pub fn state(&self) -> &PagerState {
        &self.state
    }

    pub async fn step(&mut self) -> PageStep {
        let PagerState::HasMore { url, first_page } = self.state.clone() else {
            return PageStep::Finished;
        };

        let sent_url = if first_page {
            url.clone()
        } else {
            format!("{url}{PAGE_SIZE_HINT}")
        };

        let mut response = match self.transport.get(&sent_url).await {
            Ok(response) => response,
            Err(err) => {
                warn!(url = %sent_url, %err, "feed request failed");
                return PageStep::Retry;
            }
        };

        // The hint is not accepted everywhere; fall back to the plain URL.
        if response.status == 400 {
            response = match self.transport.get(&url).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(%url, %err, "feed request failed");
                    return PageStep::Retry;
                }
            };
        }

        match response.status {
            200 => {
                let page = match atom::parse_page(&response.body, first_page, &self.entity_name) {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(%url, %err, "cannot parse feed page");
                        return PageStep::Retry;
                    }
                };
                self.state = match page.next_link {
                    Some(next) => PagerState::HasMore {
                        url: next,
                        first_page: false,
                    },
                    None => PagerState::Done,
                };
                PageStep::Page {
                    records: page.records,
                    inferred: page.inferred,
                }
            }
            404 => {
                error!(%url, status = 404, "feed page not found");
                self.state = PagerState::Done;
                PageStep::Finished
            }
            status => {
                error!(%url, status, "feed returned error status");
                PageStep::Retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedResponse;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<anyhow::Result<FeedResponse>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn with_responses(responses: Vec<anyhow::Result<FeedResponse>>) -> Self {
            Self {
                responses: Mutex::new(VecDeque::from(responses)),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn ok(body: &str) -> anyhow::Result<FeedResponse> {
            Ok(FeedResponse {
                status: 200,
                body: body.to_string(),
            })
        }

        fn status(status: u16) -> anyhow::Result<FeedResponse> {
            Ok(FeedResponse {
                status,
                body: String::new(),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FeedTransport for ScriptedTransport {
        async fn get(&self, url: &str) -> anyhow::Result<FeedResponse> {
            self.calls.lock().unwrap().push(url.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ScriptedTransport::status(500))
        }
    }

    const PAGED_FEED: &str = r#"<feed xmlns="http://www.w3.org/2005/Atom" xmlns:d="http://schemas.microsoft.com/ado/2007/08/dataservices" xmlns:m="http://schemas.microsoft.com/ado/2007/08/dataservices/metadata">
  <link rel="next" href="https://feed/Task?$skiptoken=2"/>
  <entry><content><m:properties><d:Id m:type="Edm.Int32">1</d:Id></m:properties></content></entry>
</feed>"#;

    const LAST_FEED: &str = r#"<feed xmlns="http://www.w3.org/2005/Atom" xmlns:d="http://schemas.microsoft.com/ado/2007/08/dataservices" xmlns:m="http://schemas.microsoft.com/ado/2007/08/dataservices/metadata">
  <entry><content><m:properties><d:Id m:type="Edm.Int32">2</d:Id></m:properties></content></entry>
</feed>"#;

    fn window() -> DateWindow {
        let windows = crate::windows::plan("2024-01-01", "2024-01-10", "5d").unwrap();
        windows[0]
    }

    #[test]
    fn window_url_substitutes_placeholders() {
        let url = window_url(
            "https://h/Doc?$filter=Date ge datetime'#STARTDATE#' and Date le datetime'#FINISHDATE#'",
            &window(),
        );
        assert!(url.contains("datetime'2024-01-01T00:00:00'"));
        assert!(url.contains("datetime'2024-01-06T23:59:59'"));
    }

    #[tokio::test]
    async fn windowed_json_fetch_normalizes_records() {
        let body = json!({
            "value": [
                {"Ref_Key": "a", "Total": 2, "Goods": [{"LineNumber": 1}]},
                {"Ref_Key": "b", "Total": null, "Goods": []}
            ]
        })
        .to_string();
        let transport = ScriptedTransport::with_responses(vec![ScriptedTransport::ok(&body)]);
        let pager = WindowedPager::new(&transport, FeedFormat::Json);

        let records = pager.fetch("https://h/Doc?$filter=x").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("Ref_Key"), Some(&FieldValue::text("a")));
        assert!(matches!(records[0].get("Goods"), Some(FieldValue::Rows(rows)) if rows.len() == 1));
        assert_eq!(records[1].get("Total"), Some(&FieldValue::null()));

        // The request asked for the JSON envelope.
        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("https://h/Doc?$format=json;odata=nometadata&"));
    }

    #[tokio::test]
    async fn windowed_markup_fetch_parses_entries() {
        let transport = ScriptedTransport::with_responses(vec![ScriptedTransport::ok(LAST_FEED)]);
        let pager = WindowedPager::new(&transport, FeedFormat::Markup);
        let records = pager.fetch("https://h/Doc").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("Id"), Some(&FieldValue::text("2")));
    }

    #[tokio::test]
    async fn windowed_fetch_retries_then_succeeds() {
        let transport = ScriptedTransport::with_responses(vec![
            Err(anyhow!("connection reset")),
            ScriptedTransport::status(503),
            ScriptedTransport::ok(LAST_FEED),
        ]);
        let pager =
            WindowedPager::new(&transport, FeedFormat::Markup).with_retry_pause(Duration::ZERO);
        let records = pager.fetch("https://h/Doc").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn windowed_fetch_gives_up_after_bounded_retries() {
        let transport = ScriptedTransport::with_responses(vec![]);
        let pager =
            WindowedPager::new(&transport, FeedFormat::Markup).with_retry_pause(Duration::ZERO);
        assert!(pager.fetch("https://h/Doc").await.is_none());
        assert_eq!(transport.calls().len(), RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn link_pager_follows_next_then_finishes() {
        let transport = ScriptedTransport::with_responses(vec![
            ScriptedTransport::ok(PAGED_FEED),
            ScriptedTransport::ok(LAST_FEED),
        ]);
        let mut pager = LinkFollowingPager::new(&transport, "tasks", "https://feed/Task");

        let step = pager.step().await;
        match step {
            PageStep::Page { records, inferred } => {
                assert_eq!(records.len(), 1);
                assert!(inferred.is_some());
            }
            other => panic!("expected page, got {other:?}"),
        }
        assert_eq!(
            pager.state(),
            &PagerState::HasMore {
                url: "https://feed/Task?$skiptoken=2".to_string(),
                first_page: false,
            }
        );

        let step = pager.step().await;
        match step {
            PageStep::Page { inferred, .. } => assert!(inferred.is_none()),
            other => panic!("expected page, got {other:?}"),
        }
        assert_eq!(pager.state(), &PagerState::Done);
        assert!(matches!(pager.step().await, PageStep::Finished));

        // The continuation request carries the page-size hint.
        let calls = transport.calls();
        assert_eq!(calls[0], "https://feed/Task");
        assert_eq!(calls[1], "https://feed/Task?$skiptoken=2&$top=1000");
    }

    #[tokio::test]
    async fn link_pager_400_falls_back_to_unhinted_url() {
        let transport = ScriptedTransport::with_responses(vec![
            ScriptedTransport::ok(PAGED_FEED),
            ScriptedTransport::status(400),
            ScriptedTransport::ok(LAST_FEED),
        ]);
        let mut pager = LinkFollowingPager::new(&transport, "tasks", "https://feed/Task");
        pager.step().await;
        let step = pager.step().await;
        assert!(matches!(step, PageStep::Page { .. }));

        let calls = transport.calls();
        assert_eq!(calls[1], "https://feed/Task?$skiptoken=2&$top=1000");
        assert_eq!(calls[2], "https://feed/Task?$skiptoken=2");
    }

    #[tokio::test]
    async fn link_pager_404_finishes() {
        let transport = ScriptedTransport::with_responses(vec![ScriptedTransport::status(404)]);
        let mut pager = LinkFollowingPager::new(&transport, "tasks", "https://feed/Task");
        assert!(matches!(pager.step().await, PageStep::Finished));
        assert_eq!(pager.state(), &PagerState::Done);
    }

    #[tokio::test]
    async fn link_pager_other_errors_keep_state() {
        let transport = ScriptedTransport::with_responses(vec![ScriptedTransport::status(503)]);
        let mut pager = LinkFollowingPager::new(&transport, "tasks", "https://feed/Task");
        assert!(matches!(pager.step().await, PageStep::Retry));
        assert_eq!(
            pager.state(),
            &PagerState::HasMore {
                url: "https://feed/Task".to_string(),
                first_page: true,
            }
        );
    }
}
