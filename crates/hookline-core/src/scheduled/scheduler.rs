//! Delivery Worker - Claims due delivery units and dispatches them per campaign

use super::context::{ContextError, TestSendRequest};
use super::message::{generate_email, generate_sms, EmailMessage, SmsMessage};
use super::stop_hook::{NoopStopHook, StopHook};
use super::tracking::RedirectCipher;
use super::transport::{DeliveryResult, MailTransport, SmsTransport};
use chrono::{DateTime, Duration, Utc};
use hookline_common::types::{CampaignId, DeliveryUnitId};
use hookline_common::{Error, Result};
use hookline_storage::models::{CampaignContext, CampaignStatus, Channel, DeliveryUnit};
use hookline_storage::repository::{CampaignStore, DeliveryUnitStore};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome counts for one dispatched campaign group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReport {
    pub campaign_id: CampaignId,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    /// Claimed but not yet due, released unsent
    pub deferred: usize,
}

/// Running totals across all cycles
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub cycles: AtomicU64,
    pub sent: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
}

impl DispatchStats {
    fn record(&self, report: &GroupReport) {
        self.sent.fetch_add(report.sent as u64, Ordering::Relaxed);
        self.retried.fetch_add(report.retried as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
    }
}

/// Everything a dispatch task needs, shared across spawned groups
struct Dispatcher {
    units: Arc<dyn DeliveryUnitStore>,
    campaigns: Arc<dyn CampaignStore>,
    mailer: Arc<dyn MailTransport>,
    sms: Arc<dyn SmsTransport>,
    cipher: RedirectCipher,
    max_send_attempts: i32,
    stats: DispatchStats,
}

/// Delivery worker
pub struct DeliveryWorker {
    dispatcher: Arc<Dispatcher>,
    stop_hook: Arc<dyn StopHook>,
    /// Bounds the number of campaign groups sending at once
    groups: Arc<Semaphore>,
    poll_interval: StdDuration,
}

impl DeliveryWorker {
    /// Create a new delivery worker
    pub fn new(
        units: Arc<dyn DeliveryUnitStore>,
        campaigns: Arc<dyn CampaignStore>,
        mailer: Arc<dyn MailTransport>,
        sms: Arc<dyn SmsTransport>,
        cipher: RedirectCipher,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher {
                units,
                campaigns,
                mailer,
                sms,
                cipher,
                max_send_attempts: 8,
                stats: DispatchStats::default(),
            }),
            stop_hook: Arc::new(NoopStopHook),
            groups: Arc::new(Semaphore::new(32)),
            poll_interval: StdDuration::from_secs(60),
        }
    }

    /// Set the scheduled-stop hook
    pub fn with_stop_hook(mut self, hook: Arc<dyn StopHook>) -> Self {
        self.stop_hook = hook;
        self
    }

    /// Set the maximum number of groups dispatched concurrently
    pub fn with_max_concurrent_groups(mut self, limit: usize) -> Self {
        self.groups = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    /// Set poll interval
    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval = StdDuration::from_secs(secs.max(1));
        self
    }

    /// Set the attempt limit for transient failures
    pub fn with_max_send_attempts(mut self, attempts: i32) -> Self {
        if let Some(dispatcher) = Arc::get_mut(&mut self.dispatcher) {
            dispatcher.max_send_attempts = attempts.max(1);
        }
        self
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.dispatcher.stats
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Delivery worker started (interval: {}s, max groups: {})",
            self.poll_interval.as_secs(),
            self.groups.available_permits()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Delivery worker stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let now = Utc::now();
            self.dispatcher.stats.cycles.fetch_add(1, Ordering::Relaxed);

            match self.process_campaigns(now).await {
                Ok(handles) if !handles.is_empty() => {
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(supervise(dispatcher, handles));
                }
                Ok(_) => {}
                Err(e) => error!("Error processing delivery units: {}", e),
            }

            if let Err(e) = self.process_shutdowns(now).await {
                error!("Error processing scheduled stops: {}", e);
            }
        }
    }

    /// Claim every unit due at `now`, group by campaign and spawn one
    /// dispatch task per group. Claiming finishes before any claimed group is
    /// dispatched. Campaigns left with unlaunched creation-locked units are
    /// launched first.
    pub async fn process_campaigns(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JoinHandle<GroupReport>>> {
        let mut handles = self.resume_launches(now).await?;

        let claimed = self.dispatcher.units.claim_due(now).await?;
        if claimed.is_empty() {
            return Ok(handles);
        }

        debug!("Claimed {} delivery units", claimed.len());

        let mut by_campaign: HashMap<CampaignId, Vec<DeliveryUnit>> = HashMap::new();
        for unit in claimed {
            by_campaign.entry(unit.campaign_id).or_default().push(unit);
        }

        for (campaign_id, mut units) in by_campaign {
            let context = match self.dispatcher.campaigns.get_campaign_context(campaign_id).await {
                Ok(Some(context)) => Arc::new(context),
                Ok(None) => {
                    warn!(
                        campaign_id = %campaign_id,
                        "Campaign missing, failing {} units",
                        units.len()
                    );
                    for unit in &units {
                        let missing = DeliveryResult::PermanentFailure {
                            error: "campaign not found".to_string(),
                        };
                        self.dispatcher.settle(unit, &missing).await;
                    }
                    continue;
                }
                Err(e) => {
                    error!(campaign_id = %campaign_id, "Failed to load campaign: {}", e);
                    self.dispatcher.release(&units).await;
                    continue;
                }
            };

            for unit in units.iter_mut() {
                unit.cache_campaign(context.clone());
            }

            let dispatcher = self.dispatcher.clone();
            let groups = self.groups.clone();
            handles.push(tokio::spawn(async move {
                let _permit = groups.acquire_owned().await;
                dispatcher.dispatch_group(context, units, Utc::now().max(now)).await
            }));
        }

        Ok(handles)
    }

    /// Stop campaigns past their scheduled stop date. A campaign whose stop
    /// hook fails stays in progress and is retried next cycle.
    pub async fn process_shutdowns(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.dispatcher.campaigns.get_expired(now).await?;
        let mut stopped = 0;

        for campaign in expired {
            if let Err(e) = self.stop_hook.stop(&campaign).await {
                warn!(campaign_id = %campaign.id, "Stop hook failed, will retry: {}", e);
                continue;
            }

            match self.dispatcher.campaigns.complete_campaign(campaign.id, now).await {
                Ok(_) => {
                    info!(campaign_id = %campaign.id, "Campaign reached its scheduled stop");
                    stopped += 1;
                }
                Err(e) => error!(campaign_id = %campaign.id, "Failed to complete campaign: {}", e),
            }
        }

        Ok(stopped)
    }

    /// Send a campaign's due units right away instead of waiting for the
    /// next tick. Units locked when the campaign was created are handed over
    /// once; everything else must be won through the lock.
    pub async fn launch_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<JoinHandle<GroupReport>> {
        let handle = self.start_launch(campaign_id, Utc::now()).await?;
        let dispatcher = self.dispatcher.clone();
        Ok(tokio::spawn(async move {
            match handle.await {
                Ok(report) => {
                    dispatcher.stats.record(&report);
                    report
                }
                Err(e) => {
                    error!(campaign_id = %campaign_id, "Launch task error: {}", e);
                    GroupReport {
                        campaign_id,
                        ..Default::default()
                    }
                }
            }
        }))
    }

    async fn start_launch(
        &self,
        campaign_id: CampaignId,
        now: DateTime<Utc>,
    ) -> Result<JoinHandle<GroupReport>> {
        let context = self
            .dispatcher
            .campaigns
            .get_campaign_context(campaign_id)
            .await?
            .map(Arc::new)
            .ok_or_else(|| Error::NotFound(format!("campaign {}", campaign_id)))?;

        let units = self.dispatcher.units.list_for_campaign(campaign_id).await?;

        let unlocked: Vec<_> = units.iter().filter(|u| !u.processing).map(|u| u.id).collect();
        let mut won: HashSet<DeliveryUnitId> = self
            .dispatcher
            .units
            .lock_units(&unlocked, true)
            .await?
            .into_iter()
            .collect();
        won.extend(
            self.dispatcher
                .units
                .take_over_launch(campaign_id, context.campaign.created_date)
                .await?,
        );

        let mut owned = Vec::new();
        for mut unit in units {
            if won.contains(&unit.id) {
                unit.processing = true;
                unit.cache_campaign(context.clone());
                owned.push(unit);
            }
        }

        info!(campaign_id = %campaign_id, "Launching campaign with {} units", owned.len());

        let dispatcher = self.dispatcher.clone();
        let groups = self.groups.clone();
        Ok(tokio::spawn(async move {
            let _permit = groups.acquire_owned().await;
            dispatcher.dispatch_group(context, owned, Utc::now().max(now)).await
        }))
    }

    /// Launch campaigns whose creation-locked units were never handed to a
    /// launcher, e.g. after a restart between create and launch
    async fn resume_launches(&self, now: DateTime<Utc>) -> Result<Vec<JoinHandle<GroupReport>>> {
        let pending = self.dispatcher.units.pending_launches().await?;
        let mut handles = Vec::with_capacity(pending.len());
        for campaign_id in pending {
            match self.start_launch(campaign_id, now).await {
                Ok(handle) => handles.push(handle),
                Err(e) => error!(campaign_id = %campaign_id, "Failed to resume launch: {}", e),
            }
        }
        Ok(handles)
    }

    /// Render and send a one-off test email, waiting for the outcome.
    /// Returns the Message-ID assigned by the transport.
    pub async fn send_test_email(&self, request: TestSendRequest) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(async move {
            let outcome = dispatcher.send_test(request).await;
            let _ = tx.send(outcome);
        });

        rx.await
            .map_err(|_| Error::Internal("test send task dropped".to_string()))?
    }
}

async fn supervise(dispatcher: Arc<Dispatcher>, handles: Vec<JoinHandle<GroupReport>>) {
    for handle in handles {
        match handle.await {
            Ok(report) => {
                debug!(
                    campaign_id = %report.campaign_id,
                    sent = report.sent,
                    retried = report.retried,
                    failed = report.failed,
                    deferred = report.deferred,
                    "Campaign group dispatched"
                );
                dispatcher.stats.record(&report);
            }
            Err(e) => error!("Dispatch task error: {}", e),
        }
    }
}

impl Dispatcher {
    async fn dispatch_group(
        &self,
        context: Arc<CampaignContext>,
        units: Vec<DeliveryUnit>,
        now: DateTime<Utc>,
    ) -> GroupReport {
        let mut report = GroupReport {
            campaign_id: context.campaign.id,
            ..Default::default()
        };

        let (due, later): (Vec<_>, Vec<_>) = units.into_iter().partition(|u| u.send_date <= now);
        report.deferred = later.len();
        self.release(&later).await;

        if due.is_empty() {
            return report;
        }

        let results = match context.campaign.channel_enum().unwrap_or_default() {
            Channel::Email => self.send_email_group(&context, &due).await,
            Channel::Sms => self.send_sms_group(&context, &due).await,
        };

        let mut attempted = HashSet::with_capacity(results.len());
        for (unit, result) in results {
            match &result {
                DeliveryResult::Sent { .. } => report.sent += 1,
                DeliveryResult::TemporaryFailure { .. }
                    if unit.send_attempt + 1 < self.max_send_attempts =>
                {
                    report.retried += 1
                }
                _ => report.failed += 1,
            }
            self.settle(unit, &result).await;
            attempted.insert(unit.id);
        }

        let unattempted: Vec<DeliveryUnit> = due
            .iter()
            .filter(|u| !attempted.contains(&u.id))
            .cloned()
            .collect();
        self.release(&unattempted).await;

        if report.sent > 0 && context.campaign.status_enum() == Some(CampaignStatus::Queued) {
            if let Err(e) = self
                .campaigns
                .update_status(context.campaign.id, CampaignStatus::InProgress)
                .await
            {
                error!(
                    campaign_id = %context.campaign.id,
                    "Failed to mark campaign in progress: {}", e
                );
            }
        }

        report
    }

    async fn send_email_group<'a>(
        &self,
        context: &CampaignContext,
        units: &'a [DeliveryUnit],
    ) -> Vec<(&'a DeliveryUnit, DeliveryResult)> {
        let Some(smtp) = &context.smtp else {
            return fail_all(units, "campaign has no sending profile");
        };

        let headers = smtp.header_pairs();
        let mut outcomes = Vec::new();
        let mut ready: Vec<(&DeliveryUnit, EmailMessage)> = Vec::new();

        for unit in units {
            let generated = generate_email(
                context,
                &context.template,
                &headers,
                &unit.recipient(),
                &unit.r_id,
                &self.cipher,
            );
            match generated {
                Ok(message) => ready.push((unit, message)),
                Err(e) => outcomes.push((unit, generation_failure(unit, e))),
            }
        }

        let (sending, messages): (Vec<_>, Vec<_>) = ready.into_iter().unzip();
        if !messages.is_empty() {
            let results = self.mailer.send_batch(smtp, messages).await;
            outcomes.extend(sending.into_iter().zip(results));
        }
        outcomes
    }

    async fn send_sms_group<'a>(
        &self,
        context: &CampaignContext,
        units: &'a [DeliveryUnit],
    ) -> Vec<(&'a DeliveryUnit, DeliveryResult)> {
        let Some(profile) = &context.sms else {
            return fail_all(units, "campaign has no SMS profile");
        };

        let mut outcomes = Vec::new();
        let mut ready: Vec<(&DeliveryUnit, SmsMessage)> = Vec::new();

        for unit in units {
            match generate_sms(context, &context.template, &unit.recipient(), &unit.r_id) {
                Ok(message) => ready.push((unit, message)),
                Err(e) => outcomes.push((unit, generation_failure(unit, e))),
            }
        }

        let (sending, messages): (Vec<_>, Vec<_>) = ready.into_iter().unzip();
        if !messages.is_empty() {
            let results = self.sms.send_batch(profile, messages).await;
            outcomes.extend(sending.into_iter().zip(results));
        }
        outcomes
    }

    /// Apply a delivery outcome to its unit
    async fn settle(&self, unit: &DeliveryUnit, result: &DeliveryResult) {
        let outcome = match result {
            DeliveryResult::Sent { message_id } => {
                debug!(r_id = %unit.r_id, message_id = %message_id, "Delivered");
                self.units.mark_success(unit).await
            }
            DeliveryResult::TemporaryFailure { error } => {
                if unit.send_attempt + 1 >= self.max_send_attempts {
                    warn!(
                        r_id = %unit.r_id,
                        "Giving up after {} attempts: {}",
                        unit.send_attempt + 1,
                        error
                    );
                    self.units.mark_error(unit).await
                } else {
                    let next_send = backoff_date(unit);
                    warn!(
                        r_id = %unit.r_id,
                        next_send = %next_send,
                        "Temporary failure: {}", error
                    );
                    self.units.backoff(unit, next_send).await
                }
            }
            DeliveryResult::PermanentFailure { error } => {
                warn!(r_id = %unit.r_id, "Permanent failure: {}", error);
                self.units.mark_error(unit).await
            }
            DeliveryResult::Bounced { bounce_type, reason } => {
                warn!(r_id = %unit.r_id, "Bounced ({}): {}", bounce_type, reason);
                self.units.mark_error(unit).await
            }
        };

        if let Err(e) = outcome {
            error!(r_id = %unit.r_id, "Failed to record delivery outcome: {}", e);
        }
    }

    async fn release(&self, units: &[DeliveryUnit]) {
        for unit in units {
            if let Err(e) = self.units.unlock(unit.id).await {
                error!(r_id = %unit.r_id, "Failed to unlock delivery unit: {}", e);
            }
        }
    }

    async fn send_test(&self, request: TestSendRequest) -> Result<String> {
        let message = generate_email(
            &request,
            &request.template,
            &request.smtp.header_pairs(),
            &request.recipient,
            &request.r_id,
            &self.cipher,
        )
        .map_err(|e| Error::Template(e.to_string()))?;

        let result = self
            .mailer
            .send_batch(&request.smtp, vec![message])
            .await
            .into_iter()
            .next();

        match result {
            Some(DeliveryResult::Sent { message_id }) => Ok(message_id),
            Some(DeliveryResult::TemporaryFailure { error })
            | Some(DeliveryResult::PermanentFailure { error }) => Err(Error::Transport(error)),
            Some(DeliveryResult::Bounced { reason, .. }) => Err(Error::Transport(reason)),
            None => Err(Error::Transport("message was not attempted".to_string())),
        }
    }
}

/// Next send date after a transient failure: 2^(attempt + 1) minutes later
fn backoff_date(unit: &DeliveryUnit) -> DateTime<Utc> {
    let exponent = (unit.send_attempt + 1).clamp(0, 16) as u32;
    unit.send_date + Duration::minutes(2i64.pow(exponent))
}

fn fail_all<'a>(units: &'a [DeliveryUnit], error: &str) -> Vec<(&'a DeliveryUnit, DeliveryResult)> {
    units
        .iter()
        .map(|u| {
            (u, DeliveryResult::PermanentFailure {
                error: error.to_string(),
            })
        })
        .collect()
}

fn generation_failure(unit: &DeliveryUnit, e: ContextError) -> DeliveryResult {
    warn!(r_id = %unit.r_id, "Failed to generate message: {}", e);
    DeliveryResult::PermanentFailure { error: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduled::manager::{CampaignManager, NewCampaign};
    use async_trait::async_trait;
    use hookline_common::types::Recipient;
    use hookline_storage::models::{
        Campaign, CreateCampaign, CreateResult, SendingProfile, SmsProfile,
    };
    use hookline_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Records messages and answers from a script, `Sent` once it runs out
    #[derive(Default)]
    struct ScriptedMailer {
        script: Mutex<Vec<DeliveryResult>>,
        sent: Mutex<Vec<EmailMessage>>,
    }

    impl ScriptedMailer {
        fn with_script(script: Vec<DeliveryResult>) -> Self {
            Self {
                script: Mutex::new(script),
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<EmailMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MailTransport for ScriptedMailer {
        async fn send_batch(
            &self,
            _profile: &SendingProfile,
            messages: Vec<EmailMessage>,
        ) -> Vec<DeliveryResult> {
            let mut script = self.script.lock().unwrap();
            let results = messages
                .iter()
                .map(|m| {
                    if script.is_empty() {
                        DeliveryResult::Sent {
                            message_id: format!("<{}@test>", m.r_id),
                        }
                    } else {
                        script.remove(0)
                    }
                })
                .collect();
            self.sent.lock().unwrap().extend(messages);
            results
        }
    }

    #[derive(Default)]
    struct RecordingSms {
        sent: Mutex<Vec<SmsMessage>>,
    }

    #[async_trait]
    impl SmsTransport for RecordingSms {
        async fn send_batch(
            &self,
            _profile: &SmsProfile,
            messages: Vec<SmsMessage>,
        ) -> Vec<DeliveryResult> {
            let results = messages
                .iter()
                .map(|m| DeliveryResult::Sent {
                    message_id: m.r_id.clone(),
                })
                .collect();
            self.sent.lock().unwrap().extend(messages);
            results
        }
    }

    struct FailingHook;

    #[async_trait]
    impl StopHook for FailingHook {
        async fn stop(&self, _campaign: &Campaign) -> Result<()> {
            Err(Error::Transport("teardown unavailable".to_string()))
        }
    }

    /// Fails every call; the first one also takes `first_delay`
    struct SlowFailingHook {
        first_delay: StdDuration,
        calls: AtomicU64,
    }

    #[async_trait]
    impl StopHook for SlowFailingHook {
        async fn stop(&self, _campaign: &Campaign) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(self.first_delay).await;
            }
            Err(Error::Transport("teardown unavailable".to_string()))
        }
    }

    /// Answers only the first message of each batch
    #[derive(Default)]
    struct FirstOnlyMailer {
        sent: Mutex<Vec<EmailMessage>>,
    }

    #[async_trait]
    impl MailTransport for FirstOnlyMailer {
        async fn send_batch(
            &self,
            _profile: &SendingProfile,
            messages: Vec<EmailMessage>,
        ) -> Vec<DeliveryResult> {
            let results = messages
                .iter()
                .take(1)
                .map(|m| DeliveryResult::Sent {
                    message_id: m.r_id.clone(),
                })
                .collect();
            self.sent.lock().unwrap().extend(messages.into_iter().take(1));
            results
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        mailer: Arc<ScriptedMailer>,
        sms: Arc<RecordingSms>,
        user_id: Uuid,
    }

    impl Fixture {
        fn new(mailer: ScriptedMailer) -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                mailer: Arc::new(mailer),
                sms: Arc::new(RecordingSms::default()),
                user_id: Uuid::new_v4(),
            }
        }

        fn worker(&self) -> DeliveryWorker {
            DeliveryWorker::new(
                self.store.clone(),
                self.store.clone(),
                self.mailer.clone(),
                self.sms.clone(),
                RedirectCipher::new(b"HooklineRedirectKey0123456789abc").unwrap(),
            )
            .with_max_send_attempts(3)
        }

        async fn profile(&self) -> SendingProfile {
            let profile = SendingProfile {
                id: Uuid::new_v4(),
                user_id: self.user_id,
                name: "relay".to_string(),
                host: "smtp.example.net".to_string(),
                port: 587,
                username: None,
                password: None,
                from_address: "IT Desk <it@example.net>".to_string(),
                ignore_cert_errors: false,
                headers: serde_json::json!({}),
                modified_date: Utc::now(),
            };
            self.store.insert_sending_profile(profile.clone()).await;
            profile
        }

        async fn campaign(&self, channel: Channel, send_dates: &[DateTime<Utc>]) -> Campaign {
            self.campaign_with_stop(channel, send_dates, None).await
        }

        async fn campaign_with_stop(
            &self,
            channel: Channel,
            send_dates: &[DateTime<Utc>],
            stop: Option<DateTime<Utc>>,
        ) -> Campaign {
            let template = self
                .store
                .insert_template(
                    self.user_id,
                    "reset",
                    "Reset for {{.FirstName}}",
                    "Go to {{.URL}}",
                    "",
                )
                .await;
            let (smtp_id, sms_id) = match channel {
                Channel::Email => (Some(self.profile().await.id), None),
                Channel::Sms => {
                    let profile = SmsProfile {
                        id: Uuid::new_v4(),
                        user_id: self.user_id,
                        name: "twilio".to_string(),
                        account_sid: "AC1".to_string(),
                        auth_token: "t".to_string(),
                        from_number: "+15550100".to_string(),
                        modified_date: Utc::now(),
                    };
                    self.store.insert_sms_profile(profile.clone()).await;
                    (None, Some(profile.id))
                }
            };

            let created = Utc::now() - Duration::hours(1);
            let prefix = crate::token::random_token(6);
            let results = send_dates
                .iter()
                .enumerate()
                .map(|(i, date)| CreateResult {
                    r_id: format!("{}-{}", prefix, i),
                    recipient: Recipient::new(format!("user{}@corp.example", i))
                        .with_name(format!("U{}", i), "X"),
                    send_date: *date,
                    processing: false,
                })
                .collect();

            self.store
                .create_campaign(CreateCampaign {
                    user_id: self.user_id,
                    name: "Password reset".to_string(),
                    status: CampaignStatus::Queued,
                    channel,
                    attack_objective: String::new(),
                    redirect_url: String::new(),
                    url: "https://lure.example.net".to_string(),
                    landing_url: String::new(),
                    qr_size: String::new(),
                    template_id: template.id,
                    page_id: None,
                    smtp_id,
                    sms_id,
                    created_date: created,
                    launch_date: created,
                    send_by_date: None,
                    scheduled_stop_date: stop,
                    results,
                })
                .await
                .unwrap()
        }

        /// Create a campaign that starts now through the campaign manager
        async fn immediate_campaign(&self, recipients: usize) -> Campaign {
            self.store
                .insert_template(
                    self.user_id,
                    "notice",
                    "Notice for {{.FirstName}}",
                    "See {{.URL}}",
                    "",
                )
                .await;
            self.profile().await;
            let members: Vec<Recipient> = (0..recipients)
                .map(|i| {
                    Recipient::new(format!("staff{}@corp.example", i))
                        .with_name(format!("S{}", i), "Y")
                })
                .collect();
            self.store.insert_group(self.user_id, "Staff", &members).await.unwrap();

            let manager = CampaignManager::new(
                self.store.clone(),
                self.store.clone(),
                RedirectCipher::new(b"HooklineRedirectKey0123456789abc").unwrap(),
            );
            manager
                .create_campaign_at(
                    self.user_id,
                    NewCampaign {
                        name: "Policy notice".to_string(),
                        template: "notice".to_string(),
                        smtp: Some("relay".to_string()),
                        groups: vec!["Staff".to_string()],
                        url: "https://lure.example.net".to_string(),
                        ..Default::default()
                    },
                    Utc::now(),
                )
                .await
                .unwrap()
        }

        async fn statuses(&self, campaign_id: CampaignId) -> Vec<String> {
            let mut results = self.store.list_results(campaign_id).await.unwrap();
            results.sort_by(|a, b| a.r_id.cmp(&b.r_id));
            results.into_iter().map(|r| r.status).collect()
        }
    }

    async fn run_cycle(worker: &DeliveryWorker, now: DateTime<Utc>) -> Vec<GroupReport> {
        let mut reports = Vec::new();
        for handle in worker.process_campaigns(now).await.unwrap() {
            reports.push(handle.await.unwrap());
        }
        reports
    }

    #[tokio::test]
    async fn test_cycle_sends_due_units_and_starts_campaign() {
        let fixture = Fixture::new(ScriptedMailer::default());
        let now = Utc::now();
        let campaign = fixture
            .campaign(
                Channel::Email,
                &[
                    now - Duration::minutes(2),
                    now - Duration::minutes(1),
                    now + Duration::hours(1),
                ],
            )
            .await;
        let worker = fixture.worker();

        let reports = run_cycle(&worker, now).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].sent, 2);

        let sent = fixture.mailer.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].subject, "Reset for U0");
        assert!(sent[0].text.as_deref().unwrap().contains("https://lure.example.net/?um="));

        assert_eq!(fixture.statuses(campaign.id).await, vec!["sent", "sent", "scheduled"]);
        let stored = fixture.store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.status_enum(), Some(CampaignStatus::InProgress));

        let remaining = fixture.store.list_for_campaign(campaign.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(!remaining[0].processing);

        assert!(run_cycle(&worker, now).await.is_empty());
    }

    #[tokio::test]
    async fn test_claimed_but_not_yet_due_units_are_released() {
        let fixture = Fixture::new(ScriptedMailer::default());
        let now = Utc::now();
        let campaign = fixture.campaign(Channel::Email, &[now + Duration::seconds(30)]).await;
        let worker = fixture.worker();

        // Claimed with a later clock, dispatched against an earlier one
        let units = fixture.store.claim_due(now + Duration::minutes(1)).await.unwrap();
        let context = fixture.store.get_campaign_context(campaign.id).await.unwrap();
        let context = Arc::new(context.unwrap());
        let report = worker.dispatcher.dispatch_group(context, units, now).await;

        assert_eq!(report.deferred, 1);
        assert!(fixture.mailer.sent().is_empty());
        let units = fixture.store.list_for_campaign(campaign.id).await.unwrap();
        assert!(!units[0].processing);
    }

    #[tokio::test]
    async fn test_transient_failures_back_off_then_give_up() {
        let transient = || DeliveryResult::TemporaryFailure {
            error: "421 try again later".to_string(),
        };
        let script = vec![transient(), transient(), transient()];
        let fixture = Fixture::new(ScriptedMailer::with_script(script));
        let start = Utc::now() - Duration::minutes(1);
        let campaign = fixture.campaign(Channel::Email, &[start]).await;
        let worker = fixture.worker();

        let report = &run_cycle(&worker, Utc::now()).await[0];
        assert_eq!(report.retried, 1);

        let unit = fixture.store.list_for_campaign(campaign.id).await.unwrap().remove(0);
        assert_eq!(unit.send_attempt, 1);
        assert_eq!(unit.send_date, start + Duration::minutes(2));
        assert!(!unit.processing);
        assert_eq!(fixture.statuses(campaign.id).await, vec!["retrying"]);

        let report = &run_cycle(&worker, unit.send_date).await[0];
        assert_eq!(report.retried, 1);
        let unit = fixture.store.list_for_campaign(campaign.id).await.unwrap().remove(0);
        assert_eq!(unit.send_attempt, 2);

        let report = &run_cycle(&worker, unit.send_date).await[0];
        assert_eq!(report.failed, 1);
        assert!(fixture.store.list_for_campaign(campaign.id).await.unwrap().is_empty());
        assert_eq!(fixture.statuses(campaign.id).await, vec!["error"]);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_batch() {
        let fixture = Fixture::new(ScriptedMailer::with_script(vec![DeliveryResult::Bounced {
            bounce_type: "hard".to_string(),
            reason: "550 5.1.1 User unknown".to_string(),
        }]));
        let past = Utc::now() - Duration::minutes(1);
        let campaign = fixture.campaign(Channel::Email, &[past, past, past]).await;

        let report = &run_cycle(&fixture.worker(), Utc::now()).await[0];
        assert_eq!((report.sent, report.failed), (2, 1));
        let statuses = fixture.statuses(campaign.id).await;
        assert_eq!(statuses.iter().filter(|s| *s == "sent").count(), 2);
        assert_eq!(statuses.iter().filter(|s| *s == "error").count(), 1);
    }

    #[tokio::test]
    async fn test_sms_campaign_uses_sms_transport() {
        let fixture = Fixture::new(ScriptedMailer::default());
        let campaign = fixture.campaign(Channel::Sms, &[Utc::now() - Duration::minutes(1)]).await;

        run_cycle(&fixture.worker(), Utc::now()).await;

        let sent = fixture.sms.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "+15550100");
        assert_eq!(sent[0].to, "user0@corp.example");
        assert!(sent[0].body.starts_with("Go to https://lure.example.net/?um="));
        assert!(fixture.mailer.sent().is_empty());
        assert_eq!(fixture.statuses(campaign.id).await, vec!["sent"]);
    }

    #[tokio::test]
    async fn test_concurrent_cycles_never_send_twice() {
        let fixture = Fixture::new(ScriptedMailer::default());
        let past = Utc::now() - Duration::minutes(1);
        fixture.campaign(Channel::Email, &vec![past; 50]).await;
        fixture.campaign(Channel::Email, &vec![past; 50]).await;
        let worker = Arc::new(fixture.worker());

        let mut cycles = Vec::new();
        for _ in 0..4 {
            let worker = worker.clone();
            cycles.push(tokio::spawn(async move { run_cycle(&worker, Utc::now()).await }));
        }
        let mut total = 0;
        for cycle in cycles {
            total += cycle.await.unwrap().iter().map(|r| r.sent).sum::<usize>();
        }

        assert_eq!(total, 100);
        let mut rids: Vec<String> = fixture
            .mailer
            .sent()
            .into_iter()
            .map(|m| format!("{}{}", m.to, m.r_id))
            .collect();
        rids.sort();
        rids.dedup();
        assert_eq!(rids.len(), 100);
    }

    #[tokio::test]
    async fn test_stop_hook_failure_keeps_campaign_running() {
        let fixture = Fixture::new(ScriptedMailer::default());
        let stop = Some(Utc::now() - Duration::minutes(1));
        let campaign = fixture
            .campaign_with_stop(Channel::Email, &[Utc::now() + Duration::hours(2)], stop)
            .await;
        fixture.store.update_status(campaign.id, CampaignStatus::InProgress).await.unwrap();

        let failing = fixture.worker().with_stop_hook(Arc::new(FailingHook));
        assert_eq!(failing.process_shutdowns(Utc::now()).await.unwrap(), 0);
        let stored = fixture.store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.status_enum(), Some(CampaignStatus::InProgress));

        let now = Utc::now();
        assert_eq!(fixture.worker().process_shutdowns(now).await.unwrap(), 1);
        let stored = fixture.store.get_campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.status_enum(), Some(CampaignStatus::Complete));
        assert_eq!(stored.completed_date, Some(now));
        assert!(fixture.store.list_for_campaign(campaign.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_launch_sends_due_units_only() {
        let fixture = Fixture::new(ScriptedMailer::default());
        let now = Utc::now();
        let campaign = fixture
            .campaign(Channel::Email, &[now - Duration::minutes(1), now + Duration::hours(3)])
            .await;
        let worker = fixture.worker();

        let report = worker.launch_campaign(campaign.id).await.unwrap().await.unwrap();
        assert_eq!((report.sent, report.deferred), (1, 1));
        assert_eq!(fixture.statuses(campaign.id).await, vec!["sent", "scheduled"]);
        assert_eq!(worker.stats().sent.load(Ordering::Relaxed), 1);

        assert!(matches!(
            worker.launch_campaign(Uuid::new_v4()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_immediate_campaign_is_sent_by_next_cycle() {
        let fixture = Fixture::new(ScriptedMailer::default());
        let campaign = fixture.immediate_campaign(3).await;
        assert_eq!(campaign.status_enum(), Some(CampaignStatus::InProgress));
        let worker = fixture.worker();

        let reports = run_cycle(&worker, Utc::now() + Duration::minutes(1)).await;
        assert_eq!(reports.iter().map(|r| r.sent).sum::<usize>(), 3);
        assert_eq!(fixture.mailer.sent().len(), 3);
        assert_eq!(fixture.statuses(campaign.id).await, vec!["sent"; 3]);
        assert!(fixture.store.list_for_campaign(campaign.id).await.unwrap().is_empty());

        for minutes in 2..5 {
            assert!(run_cycle(&worker, Utc::now() + Duration::minutes(minutes)).await.is_empty());
        }
        assert_eq!(fixture.mailer.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_launches_send_each_unit_once() {
        let fixture = Fixture::new(ScriptedMailer::default());
        let campaign = fixture.immediate_campaign(3).await;
        let worker = Arc::new(fixture.worker());

        let (first, second) = tokio::join!(
            worker.launch_campaign(campaign.id),
            worker.launch_campaign(campaign.id)
        );
        let first = first.unwrap().await.unwrap();
        let second = second.unwrap().await.unwrap();

        assert_eq!(first.sent + second.sent, 3);
        let mut recipients: Vec<String> = fixture.mailer.sent().into_iter().map(|m| m.to).collect();
        recipients.sort();
        recipients.dedup();
        assert_eq!(recipients.len(), 3);
        assert_eq!(fixture.mailer.sent().len(), 3);
        assert_eq!(worker.stats().sent.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_launch_racing_cycle_sends_each_unit_once() {
        let fixture = Fixture::new(ScriptedMailer::default());
        let campaign = fixture.immediate_campaign(20).await;
        let worker = Arc::new(fixture.worker());

        let launching = {
            let worker = worker.clone();
            tokio::spawn(async move {
                worker.launch_campaign(campaign.id).await.unwrap().await.unwrap()
            })
        };
        let cycling = {
            let worker = worker.clone();
            tokio::spawn(async move { run_cycle(&worker, Utc::now()).await })
        };

        let launched = launching.await.unwrap().sent;
        let cycled: usize = cycling.await.unwrap().iter().map(|r| r.sent).sum();
        assert_eq!(launched + cycled, 20);
        assert_eq!(fixture.mailer.sent().len(), 20);
        assert_eq!(fixture.statuses(campaign.id).await, vec!["sent"; 20]);
    }

    #[tokio::test]
    async fn test_unattempted_units_are_released() {
        let fixture = Fixture::new(ScriptedMailer::default());
        let past = Utc::now() - Duration::minutes(1);
        let campaign = fixture.campaign(Channel::Email, &[past, past, past]).await;
        let mailer = Arc::new(FirstOnlyMailer::default());
        let worker = DeliveryWorker::new(
            fixture.store.clone(),
            fixture.store.clone(),
            mailer.clone(),
            fixture.sms.clone(),
            RedirectCipher::new(b"HooklineRedirectKey0123456789abc").unwrap(),
        );

        let report = &run_cycle(&worker, Utc::now()).await[0];
        assert_eq!((report.sent, report.failed, report.retried), (1, 0, 0));

        let left = fixture.store.list_for_campaign(campaign.id).await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|u| !u.processing && u.send_attempt == 0));
        assert_eq!(fixture.store.get_queued(Utc::now()).await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycle_does_not_burst() {
        let fixture = Fixture::new(ScriptedMailer::default());
        let stop = Some(Utc::now() - Duration::minutes(1));
        let campaign = fixture
            .campaign_with_stop(Channel::Email, &[Utc::now() + Duration::hours(2)], stop)
            .await;
        fixture.store.update_status(campaign.id, CampaignStatus::InProgress).await.unwrap();

        let hook = Arc::new(SlowFailingHook {
            first_delay: StdDuration::from_millis(3500),
            calls: AtomicU64::new(0),
        });
        let worker = Arc::new(fixture.worker().with_poll_interval(1).with_stop_hook(hook));
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(worker.clone().run(shutdown.clone()));

        // Cycles at 0s and 3.5s, then one per second. Missed ticks are not replayed.
        tokio::time::sleep(StdDuration::from_millis(5800)).await;
        shutdown.cancel();
        running.await.unwrap();

        let cycles = worker.stats().cycles.load(Ordering::Relaxed);
        assert!((3..=4).contains(&cycles), "ran {} cycles", cycles);
    }

    #[tokio::test]
    async fn test_send_test_email() {
        let fixture = Fixture::new(ScriptedMailer::default());
        let template = fixture
            .store
            .insert_template(fixture.user_id, "t", "Hello {{.FirstName}}", "{{.URL}}", "")
            .await;
        let request = TestSendRequest::new(
            template.clone(),
            fixture.profile().await,
            "https://lure.example.net",
            Recipient::new("qa@corp.example").with_name("Quinn", "A"),
        );
        let r_id = request.r_id.clone();

        let message_id = fixture.worker().send_test_email(request).await.unwrap();
        assert_eq!(message_id, format!("<{}@test>", r_id));
        let sent = fixture.mailer.sent();
        assert_eq!(sent[0].subject, "Hello Quinn");
        assert!(sent[0].r_id.starts_with("preview-"));

        let mut broken = template;
        broken.subject = "{{.Unknown}}".to_string();
        let request = TestSendRequest::new(
            broken,
            fixture.profile().await,
            "https://lure.example.net",
            Recipient::new("qa@corp.example"),
        );
        assert!(matches!(
            fixture.worker().send_test_email(request).await,
            Err(Error::Template(_))
        ));
    }

    #[test]
    fn test_backoff_date_doubles() {
        let mut unit = DeliveryUnit {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            result_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            channel: "email".to_string(),
            send_date: Utc::now(),
            send_attempt: 0,
            processing: true,
            r_id: "r".to_string(),
            email: "a@example.com".to_string(),
            first_name: String::new(),
            last_name: String::new(),
            position: String::new(),
            cached_campaign: None,
        };
        assert_eq!(backoff_date(&unit) - unit.send_date, Duration::minutes(2));
        unit.send_attempt = 3;
        assert_eq!(backoff_date(&unit) - unit.send_date, Duration::minutes(16));
    }
}
