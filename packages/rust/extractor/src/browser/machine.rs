//! The lookup state machine, independent of any particular browser.
//!
//! ```text
//! Init -> Loaded -> Submitted -> Polling -> { Found | NotFound | Timeout }
//! ```

use std::future::Future;
use std::time::Duration;

use admitsync_shared::{AdmitError, Result};
use tracing::{debug, trace};

/// Input field candidates, tried in order until one resolves.
pub const INPUT_SELECTORS: &[&str] = &[
    "input[name='sbd']",
    "input#sbd",
    "input[name='candidate_number']",
    "input[placeholder*='số báo danh' i]",
    "form input[type='text']",
    "input[type='search']",
];

/// Result containers the page may render after submission.
pub const RESULT_SELECTORS: &[&str] = &[
    "#result table",
    ".result-table",
    ".ket-qua table",
    "table.score-table",
    "[data-role='score-result']",
];

/// Body text fragments that mean the number is unknown.
pub const NOT_FOUND_MARKERS: &[&str] = &[
    "không tìm thấy",
    "không có dữ liệu",
    "số báo danh không tồn tại",
    "not found",
];

/// Operations the machine needs from a live page.
pub trait ResultPage: Send + Sync {
    /// Whether `selector` currently resolves to an element.
    fn has_element(&self, selector: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Assign `value` to the input, dispatch `input`, and request form submission.
    fn submit(&self, input_selector: &str, value: &str) -> impl Future<Output = Result<()>> + Send;

    /// Row texts inside the given container.
    fn row_texts(&self, container_selector: &str)
    -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Visible body text, lower-cased by the caller.
    fn body_text(&self) -> impl Future<Output = Result<String>> + Send;
}

/// Lookup progress. The last three variants are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupState {
    Init,
    /// Page is up and the input field was located.
    Loaded { input: &'static str },
    Submitted,
    Polling { attempt: u32 },
    /// Result rows were rendered.
    Found(Vec<String>),
    NotFound,
    Timeout,
}

impl LookupState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Found(_) | Self::NotFound | Self::Timeout)
    }
}

/// Steps a [`ResultPage`] through one lookup with bounded polling.
pub struct LookupMachine<'p, P> {
    page: &'p P,
    poll_interval: Duration,
    max_polls: u32,
    state: LookupState,
}

impl<'p, P: ResultPage> LookupMachine<'p, P> {
    /// `poll_timeout` is rounded up to whole `poll_interval`s, at least one poll.
    pub fn new(page: &'p P, poll_interval: Duration, poll_timeout: Duration) -> Self {
        let interval_ms = poll_interval.as_millis().max(1);
        let max_polls = poll_timeout.as_millis().div_ceil(interval_ms).max(1);
        Self {
            page,
            poll_interval,
            max_polls: u32::try_from(max_polls).unwrap_or(u32::MAX),
            state: LookupState::Init,
        }
    }

    pub fn state(&self) -> &LookupState {
        &self.state
    }

    /// Drive the machine to a terminal state.
    pub async fn run(mut self, number: &str) -> Result<LookupState> {
        while !self.state.is_terminal() {
            self.step(number).await?;
        }
        Ok(self.state)
    }

    /// Advance by one transition.
    pub async fn step(&mut self, number: &str) -> Result<()> {
        let next = match &self.state {
            LookupState::Init => {
                let input = self.locate_input().await?;
                LookupState::Loaded { input }
            }
            LookupState::Loaded { input } => {
                self.page.submit(input, number).await?;
                LookupState::Submitted
            }
            LookupState::Submitted => LookupState::Polling { attempt: 0 },
            LookupState::Polling { attempt } => self.poll(*attempt).await?,
            terminal => terminal.clone(),
        };
        trace!(from = ?self.state, to = ?next, "lookup transition");
        self.state = next;
        Ok(())
    }

    async fn locate_input(&self) -> Result<&'static str> {
        for &selector in INPUT_SELECTORS {
            if self.page.has_element(selector).await? {
                debug!(selector, "located input field");
                return Ok(selector);
            }
        }
        Err(AdmitError::Browser(
            "no candidate-number input field on the lookup page".into(),
        ))
    }

    async fn poll(&self, attempt: u32) -> Result<LookupState> {
        let body = self.page.body_text().await?.to_lowercase();
        if NOT_FOUND_MARKERS.iter().any(|m| body.contains(m)) {
            return Ok(LookupState::NotFound);
        }

        for selector in RESULT_SELECTORS {
            if self.page.has_element(selector).await? {
                let rows = self.page.row_texts(selector).await?;
                if !rows.is_empty() {
                    return Ok(LookupState::Found(rows));
                }
            }
        }

        let attempt = attempt + 1;
        if attempt >= self.max_polls {
            return Ok(LookupState::Timeout);
        }
        tokio::time::sleep(self.poll_interval).await;
        Ok(LookupState::Polling { attempt })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A page that renders results after `ready_after` polls.
    struct FakePage {
        input: &'static str,
        ready_after: Option<u32>,
        not_found: bool,
        polls: AtomicU32,
        submitted: Mutex<Option<(String, String)>>,
    }

    impl FakePage {
        fn new(input: &'static str) -> Self {
            Self {
                input,
                ready_after: None,
                not_found: false,
                polls: AtomicU32::new(0),
                submitted: Mutex::new(None),
            }
        }
    }

    impl ResultPage for FakePage {
        async fn has_element(&self, selector: &str) -> Result<bool> {
            if selector == self.input {
                return Ok(true);
            }
            Ok(selector == RESULT_SELECTORS[1]
                && self
                    .ready_after
                    .is_some_and(|n| self.polls.load(Ordering::SeqCst) >= n))
        }

        async fn submit(&self, input_selector: &str, value: &str) -> Result<()> {
            *self.submitted.lock().unwrap() = Some((input_selector.into(), value.into()));
            Ok(())
        }

        async fn row_texts(&self, _container: &str) -> Result<Vec<String>> {
            Ok(vec!["Toán 8.5".into(), "Ngữ văn 7.0".into()])
        }

        async fn body_text(&self) -> Result<String> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(if self.not_found {
                "Không tìm thấy thí sinh".into()
            } else {
                "Đang tải...".into()
            })
        }
    }

    const FAST: Duration = Duration::from_millis(1);

    #[tokio::test]
    async fn reaches_found_after_polling() {
        let mut page = FakePage::new(INPUT_SELECTORS[1]);
        page.ready_after = Some(3);

        let state = LookupMachine::new(&page, FAST, Duration::from_millis(50))
            .run("12345678")
            .await
            .unwrap();

        assert_eq!(
            state,
            LookupState::Found(vec!["Toán 8.5".into(), "Ngữ văn 7.0".into()])
        );
        assert_eq!(
            page.submitted.lock().unwrap().clone(),
            Some((INPUT_SELECTORS[1].to_string(), "12345678".to_string()))
        );
    }

    #[tokio::test]
    async fn stops_on_not_found_marker() {
        let mut page = FakePage::new(INPUT_SELECTORS[0]);
        page.not_found = true;

        let state = LookupMachine::new(&page, FAST, Duration::from_millis(50))
            .run("12345678")
            .await
            .unwrap();
        assert_eq!(state, LookupState::NotFound);
        assert_eq!(page.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn polling_is_bounded() {
        let page = FakePage::new(INPUT_SELECTORS[0]);

        let state = LookupMachine::new(&page, FAST, Duration::from_millis(5))
            .run("12345678")
            .await
            .unwrap();
        assert_eq!(state, LookupState::Timeout);
        assert_eq!(page.polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn missing_input_is_browser_error() {
        let page = FakePage::new("input#nowhere");
        let mut machine = LookupMachine::new(&page, FAST, FAST);

        let err = machine.step("12345678").await.unwrap_err();
        assert!(matches!(err, AdmitError::Browser(_)));
        assert_eq!(machine.state(), &LookupState::Init);
    }

    #[tokio::test]
    async fn steps_follow_the_documented_order() {
        let mut page = FakePage::new(INPUT_SELECTORS[0]);
        page.ready_after = Some(1);
        let mut machine = LookupMachine::new(&page, FAST, Duration::from_millis(10));

        machine.step("12345678").await.unwrap();
        assert!(matches!(machine.state(), LookupState::Loaded { .. }));
        machine.step("12345678").await.unwrap();
        assert_eq!(machine.state(), &LookupState::Submitted);
        machine.step("12345678").await.unwrap();
        assert_eq!(machine.state(), &LookupState::Polling { attempt: 0 });
        machine.step("12345678").await.unwrap();
        assert!(matches!(machine.state(), LookupState::Found(_)));
    }
}
