//! Processing pipeline: fetch → classify → organize under a wall-clock budget.
//!
//! Flow per run:
//! 1. Fetch candidates for the lookback window (a failure here is fatal for the run)
//! 2. For each candidate, in fetch order: deadline check, classify, organize, count
//! 3. Pace between classifier calls
//! 4. Always disconnect before returning the report

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::classifier::Classifier;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::mailbox::{Classification, MailStore, Message};
use crate::pipeline::types::{ProcessingReport, RunState};

/// Window used by [`Pipeline::test_connection`].
const PROBE_WINDOW: Duration = Duration::from_secs(3600);

/// Bounded-time classification and filing of recent mail.
pub struct Pipeline {
    mailbox: Arc<dyn MailStore>,
    classifier: Classifier,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(mailbox: Arc<dyn MailStore>, classifier: Classifier, config: PipelineConfig) -> Self {
        Self {
            mailbox,
            classifier,
            config,
        }
    }

    /// Process messages received within `window`.
    ///
    /// Never fails: fatal problems are recorded in the report, whose `state`
    /// tells how the run ended. The mailbox is disconnected on every path.
    pub async fn run(&self, window: Duration) -> ProcessingReport {
        let started = Instant::now();
        let mut report = ProcessingReport::new();
        info!(
            run_id = %report.run_id,
            window_secs = window.as_secs(),
            budget_secs = self.config.budget.as_secs(),
            concurrency = self.config.concurrency,
            "Starting email processing"
        );

        let state = self.drive(window, started, &mut report).await;
        self.mailbox.disconnect().await;

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        report.finish(state, duration_ms);

        info!(
            run_id = %report.run_id,
            state = state.label(),
            total = report.total_emails,
            processed = report.processed_emails,
            needs_reply = report.needs_reply_count,
            business = report.business_count,
            errors = report.errors.len(),
            duration_ms,
            "Email processing finished"
        );
        if report.timeout_reached {
            warn!(remaining = report.remaining_emails, "Processing stopped at the time budget");
        }
        report
    }

    /// Liveness probe: fetch the last hour of mail, then disconnect.
    pub async fn test_connection(&self) -> bool {
        info!("Testing mailbox connection");
        let result = self.mailbox.fetch_recent(PROBE_WINDOW).await;
        self.mailbox.disconnect().await;
        match result {
            Ok(messages) => {
                info!(count = messages.len(), "Connection test succeeded");
                true
            }
            Err(e) => {
                error!(error = %e, "Connection test failed");
                false
            }
        }
    }

    // ── Run body ────────────────────────────────────────────────────

    async fn drive(
        &self,
        window: Duration,
        started: Instant,
        report: &mut ProcessingReport,
    ) -> RunState {
        transition(RunState::Fetching);
        let mut messages = match self.mailbox.fetch_recent(window).await {
            Ok(messages) => messages,
            Err(e) => {
                let err = PipelineError::Fetch(e);
                error!(error = %err, "Fetching emails failed");
                report.errors.push(err.to_string());
                return RunState::FatalError;
            }
        };

        report.total_emails = messages.len();
        if messages.is_empty() {
            info!("No new emails to process");
            return RunState::Completed;
        }
        if let Some(limit) = self.config.max_messages
            && messages.len() > limit
        {
            info!(total = messages.len(), limit, "Processing only the first chunk of emails");
            messages.truncate(limit);
        }

        transition(RunState::Classifying);
        let width = self.config.concurrency.max(1);
        let batch_count = messages.len().div_ceil(width);

        for (index, batch) in messages.chunks(width).enumerate() {
            let elapsed = started.elapsed();
            if elapsed > self.config.budget {
                report.timeout_reached = true;
                info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    unprocessed = messages.len() - index * width,
                    "Approaching time budget, stopping"
                );
                return RunState::TimedOut;
            }

            debug!(
                batch = index + 1,
                of = batch_count,
                elapsed_ms = elapsed.as_millis() as u64,
                "Classifying"
            );
            let results = join_all(batch.iter().map(|m| self.classifier.classify(m))).await;

            for (message, result) in batch.iter().zip(results) {
                match result {
                    Ok(classification) => self.apply(message, &classification, report).await,
                    Err(source) => {
                        let err = PipelineError::Classification {
                            uid: message.uid,
                            source,
                        };
                        error!(uid = message.uid, error = %err, "Email processing failed");
                        report.errors.push(err.to_string());
                    }
                }
            }

            let is_last = index + 1 == batch_count;
            if !is_last
                && started.elapsed() < self.config.budget
                && !self.config.pacing_interval.is_zero()
            {
                debug!(pause_ms = self.config.pacing_interval.as_millis() as u64, "Pacing");
                tokio::time::sleep(self.config.pacing_interval).await;
            }
        }

        RunState::Completed
    }

    /// File a classified message and update the counters.
    ///
    /// Counters move whether or not filing succeeds.
    async fn apply(
        &self,
        message: &Message,
        classification: &Classification,
        report: &mut ProcessingReport,
    ) {
        if classification.is_actionable() {
            transition(RunState::Organizing);
            self.mailbox.organize(message.uid, classification).await;
        } else {
            debug!(uid = message.uid, "Email needs no organization");
        }

        report.processed_emails += 1;
        if classification.needs_reply {
            report.needs_reply_count += 1;
        }
        if classification.is_business {
            report.business_count += 1;
        }
        info!(
            uid = message.uid,
            needs_reply = classification.needs_reply,
            is_business = classification.is_business,
            reasoning = %classification.reasoning,
            "Email processed"
        );
    }
}

fn transition(state: RunState) {
    debug!(state = state.label(), "Pipeline state");
}
