//! Strategy B: headless-browser automation of the client-rendered lookup form.

mod chromium;
mod machine;

use std::time::Duration;

use admitsync_shared::{AdmitError, BrowserSettings, Result};
use tracing::{info, instrument};

use crate::scores::{ScoreSheet, score_sheet_from_rows};

pub use chromium::{BrowserSession, ChromiumPage};
pub use machine::{
    INPUT_SELECTORS, LookupMachine, LookupState, NOT_FOUND_MARKERS, RESULT_SELECTORS, ResultPage,
};

/// Drives one browser process per lookup.
#[derive(Debug, Clone)]
pub struct BrowserStrategy {
    settings: BrowserSettings,
    form_url: String,
}

impl BrowserStrategy {
    pub fn new(settings: BrowserSettings, form_url: impl Into<String>) -> Self {
        Self {
            settings,
            form_url: form_url.into(),
        }
    }

    /// Look a candidate up through the interactive form.
    ///
    /// `Ok(None)` when the page reports the number as unknown or renders no
    /// recognizable scores.
    #[instrument(skip_all, fields(number = %number))]
    pub async fn lookup(&self, number: &str) -> Result<Option<ScoreSheet>> {
        let session = BrowserSession::launch(&self.settings).await?;
        let outcome = self.drive(&session, number).await;
        session.close().await;

        let state = outcome?;
        info!(state = ?state, "browser lookup finished");
        sheet_from_state(state, self.settings.poll_timeout_secs)
    }

    async fn drive(&self, session: &BrowserSession, number: &str) -> Result<LookupState> {
        let page = session.open(&self.form_url).await?;
        LookupMachine::new(
            &page,
            Duration::from_millis(self.settings.poll_interval_ms),
            Duration::from_secs(self.settings.poll_timeout_secs),
        )
        .run(number)
        .await
    }
}

fn sheet_from_state(state: LookupState, timeout_secs: u64) -> Result<Option<ScoreSheet>> {
    match state {
        LookupState::Found(rows) => {
            let sheet = score_sheet_from_rows(rows.iter().map(String::as_str));
            Ok((!sheet.is_empty()).then_some(sheet))
        }
        LookupState::NotFound => Ok(None),
        LookupState::Timeout => Err(AdmitError::Browser(format!(
            "no result rendered within {timeout_secs}s"
        ))),
        other => Err(AdmitError::Browser(format!(
            "lookup stopped in non-terminal state {other:?}"
        ))),
    }
}
