//! In-memory store
//!
//! Implements every repository trait over process-local maps. Used by tests
//! and by the `memory` database backend for single-process trials.

use crate::models::{
    BulkInsertOutcome, Campaign, CampaignContext, CampaignResult, CampaignStatus, CreateCampaign,
    DeliveryUnit, Group, ResultStatus, SendingProfile, SmsProfile, Target, Template,
};
use crate::repository::{CampaignStore, DeliveryUnitStore, GroupStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookline_common::types::{
    CampaignId, DeliveryUnitId, GroupId, ProfileId, Recipient, ResultId, TargetId, TemplateId,
    UserId,
};
use hookline_common::Result;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    templates: HashMap<TemplateId, Template>,
    sending_profiles: HashMap<ProfileId, SendingProfile>,
    sms_profiles: HashMap<ProfileId, SmsProfile>,
    groups: HashMap<GroupId, Group>,
    targets: HashMap<TargetId, Target>,
    targets_by_email: HashMap<String, TargetId>,
    links: HashSet<(GroupId, TargetId)>,
    campaigns: HashMap<CampaignId, Campaign>,
    results: HashMap<ResultId, CampaignResult>,
    units: HashMap<DeliveryUnitId, DeliveryUnit>,
    launched: HashSet<DeliveryUnitId>,
}

impl MemoryState {
    fn set_result_status(&mut self, result_id: ResultId, status: ResultStatus) {
        if let Some(result) = self.results.get_mut(&result_id) {
            result.status = status.to_string();
            result.modified_date = Utc::now();
        }
    }
}

/// In-memory implementation of all stores
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a template
    pub async fn insert_template(
        &self,
        user_id: UserId,
        name: &str,
        subject: &str,
        text: &str,
        html: &str,
    ) -> Template {
        let template = Template {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            subject: subject.to_string(),
            text: text.to_string(),
            html: html.to_string(),
            modified_date: Utc::now(),
        };
        self.state
            .lock()
            .await
            .templates
            .insert(template.id, template.clone());
        template
    }

    /// Add an SMTP sending profile
    pub async fn insert_sending_profile(&self, profile: SendingProfile) {
        self.state
            .lock()
            .await
            .sending_profiles
            .insert(profile.id, profile);
    }

    /// Add an SMS profile
    pub async fn insert_sms_profile(&self, profile: SmsProfile) {
        self.state.lock().await.sms_profiles.insert(profile.id, profile);
    }

    /// Add an active group with the given members
    pub async fn insert_group(
        &self,
        user_id: UserId,
        name: &str,
        members: &[Recipient],
    ) -> Result<Group> {
        let group = self.create_group_shell(user_id, name, "").await?;
        self.bulk_insert_targets(group.id, members).await?;
        self.set_group_active(group.id, true).await?;
        Ok(Group {
            is_active: true,
            ..group
        })
    }

    /// Total number of links across all groups
    pub async fn link_count(&self) -> usize {
        self.state.lock().await.links.len()
    }
}

#[async_trait]
impl DeliveryUnitStore for MemoryStore {
    async fn get_queued(&self, before: DateTime<Utc>) -> Result<Vec<DeliveryUnit>> {
        let state = self.state.lock().await;
        let mut units: Vec<DeliveryUnit> = state
            .units
            .values()
            .filter(|u| u.send_date <= before && !u.processing)
            .cloned()
            .collect();
        units.sort_by_key(|u| u.send_date);
        Ok(units)
    }

    async fn lock_units(&self, ids: &[DeliveryUnitId], lock: bool) -> Result<Vec<DeliveryUnitId>> {
        let mut state = self.state.lock().await;
        let mut changed = Vec::new();
        for id in ids {
            if let Some(unit) = state.units.get_mut(id) {
                if unit.processing != lock {
                    unit.processing = lock;
                    changed.push(*id);
                }
            }
        }
        Ok(changed)
    }

    async fn take_over_launch(
        &self,
        campaign_id: CampaignId,
        created: DateTime<Utc>,
    ) -> Result<Vec<DeliveryUnitId>> {
        let mut state = self.state.lock().await;
        let candidates: Vec<DeliveryUnitId> = state
            .units
            .values()
            .filter(|u| {
                u.campaign_id == campaign_id
                    && u.processing
                    && u.send_attempt == 0
                    && u.send_date <= created
            })
            .map(|u| u.id)
            .collect();
        Ok(candidates
            .into_iter()
            .filter(|id| state.launched.insert(*id))
            .collect())
    }

    async fn pending_launches(&self) -> Result<Vec<CampaignId>> {
        let state = self.state.lock().await;
        let mut pending: Vec<CampaignId> = state
            .units
            .values()
            .filter(|u| u.processing && u.send_attempt == 0 && !state.launched.contains(&u.id))
            .filter(|u| {
                state
                    .campaigns
                    .get(&u.campaign_id)
                    .is_some_and(|c| u.send_date <= c.created_date)
            })
            .map(|u| u.campaign_id)
            .collect();
        pending.sort();
        pending.dedup();
        Ok(pending)
    }

    async fn unlock(&self, id: DeliveryUnitId) -> Result<()> {
        if let Some(unit) = self.state.lock().await.units.get_mut(&id) {
            unit.processing = false;
        }
        Ok(())
    }

    async fn mark_success(&self, unit: &DeliveryUnit) -> Result<()> {
        let mut state = self.state.lock().await;
        state.launched.remove(&unit.id);
        state.set_result_status(unit.result_id, ResultStatus::Sent);
        state.units.remove(&unit.id);
        Ok(())
    }

    async fn mark_error(&self, unit: &DeliveryUnit) -> Result<()> {
        let mut state = self.state.lock().await;
        state.launched.remove(&unit.id);
        state.set_result_status(unit.result_id, ResultStatus::Error);
        state.units.remove(&unit.id);
        Ok(())
    }

    async fn backoff(&self, unit: &DeliveryUnit, next_send: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(stored) = state.units.get_mut(&unit.id) {
            stored.send_attempt += 1;
            stored.send_date = next_send;
            stored.processing = false;
        }
        state.set_result_status(unit.result_id, ResultStatus::Retrying);
        if let Some(result) = state.results.get_mut(&unit.result_id) {
            result.send_date = next_send;
        }
        Ok(())
    }

    async fn list_for_campaign(&self, campaign_id: CampaignId) -> Result<Vec<DeliveryUnit>> {
        let state = self.state.lock().await;
        let mut units: Vec<DeliveryUnit> = state
            .units
            .values()
            .filter(|u| u.campaign_id == campaign_id)
            .cloned()
            .collect();
        units.sort_by(|a, b| a.send_date.cmp(&b.send_date).then(a.email.cmp(&b.email)));
        Ok(units)
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn create_campaign(&self, input: CreateCampaign) -> Result<Campaign> {
        let campaign = Campaign {
            id: Uuid::now_v7(),
            user_id: input.user_id,
            name: input.name,
            status: input.status.to_string(),
            channel: input.channel.to_string(),
            attack_objective: input.attack_objective,
            redirect_url: input.redirect_url,
            url: input.url,
            landing_url: input.landing_url,
            qr_size: input.qr_size,
            template_id: input.template_id,
            page_id: input.page_id,
            smtp_id: input.smtp_id,
            sms_id: input.sms_id,
            created_date: input.created_date,
            launch_date: input.launch_date,
            send_by_date: input.send_by_date,
            scheduled_stop_date: input.scheduled_stop_date,
            completed_date: None,
        };

        let mut state = self.state.lock().await;
        for result in input.results {
            let status = result.status();
            let row = CampaignResult {
                id: Uuid::new_v4(),
                campaign_id: campaign.id,
                user_id: campaign.user_id,
                r_id: result.r_id,
                email: result.recipient.email,
                first_name: result.recipient.first_name,
                last_name: result.recipient.last_name,
                position: result.recipient.position,
                status: status.to_string(),
                send_date: result.send_date,
                reported: false,
                modified_date: campaign.created_date,
            };
            let unit = DeliveryUnit {
                id: Uuid::new_v4(),
                campaign_id: campaign.id,
                result_id: row.id,
                user_id: campaign.user_id,
                channel: campaign.channel.clone(),
                send_date: row.send_date,
                send_attempt: 0,
                processing: result.processing,
                r_id: row.r_id.clone(),
                email: row.email.clone(),
                first_name: row.first_name.clone(),
                last_name: row.last_name.clone(),
                position: row.position.clone(),
                cached_campaign: None,
            };
            state.units.insert(unit.id, unit);
            state.results.insert(row.id, row);
        }
        state.campaigns.insert(campaign.id, campaign.clone());

        Ok(campaign)
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<Campaign>> {
        Ok(self.state.lock().await.campaigns.get(&id).cloned())
    }

    async fn get_campaign_context(&self, id: CampaignId) -> Result<Option<CampaignContext>> {
        let state = self.state.lock().await;
        let Some(campaign) = state.campaigns.get(&id).cloned() else {
            return Ok(None);
        };
        let template = state
            .templates
            .get(&campaign.template_id)
            .cloned()
            .ok_or_else(|| {
                hookline_common::Error::NotFound(format!("template {}", campaign.template_id))
            })?;
        let smtp = campaign
            .smtp_id
            .and_then(|sid| state.sending_profiles.get(&sid).cloned());
        let sms = campaign
            .sms_id
            .and_then(|sid| state.sms_profiles.get(&sid).cloned());

        Ok(Some(CampaignContext {
            campaign,
            template,
            smtp,
            sms,
        }))
    }

    async fn update_status(&self, id: CampaignId, status: CampaignStatus) -> Result<()> {
        if let Some(campaign) = self.state.lock().await.campaigns.get_mut(&id) {
            campaign.status = status.to_string();
        }
        Ok(())
    }

    async fn complete_campaign(
        &self,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>> {
        let mut state = self.state.lock().await;
        state.units.retain(|_, u| u.campaign_id != id);
        Ok(state.campaigns.get_mut(&id).map(|campaign| {
            campaign.status = CampaignStatus::Complete.to_string();
            campaign.completed_date.get_or_insert(at);
            campaign.clone()
        }))
    }

    async fn delete_campaign(&self, id: CampaignId) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.units.retain(|_, u| u.campaign_id != id);
        state.results.retain(|_, r| r.campaign_id != id);
        Ok(state.campaigns.remove(&id).is_some())
    }

    async fn get_expired(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>> {
        let state = self.state.lock().await;
        Ok(state
            .campaigns
            .values()
            .filter(|c| {
                c.status_enum() == Some(CampaignStatus::InProgress)
                    && c.scheduled_stop_date.map_or(false, |stop| stop <= now)
            })
            .cloned()
            .collect())
    }

    async fn list_results(&self, campaign_id: CampaignId) -> Result<Vec<CampaignResult>> {
        let state = self.state.lock().await;
        let mut results: Vec<CampaignResult> = state
            .results
            .values()
            .filter(|r| r.campaign_id == campaign_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| a.send_date.cmp(&b.send_date).then(a.email.cmp(&b.email)));
        Ok(results)
    }

    async fn find_template_by_name(&self, user_id: UserId, name: &str) -> Result<Option<Template>> {
        let state = self.state.lock().await;
        Ok(state
            .templates
            .values()
            .find(|t| t.user_id == user_id && t.name == name)
            .cloned())
    }

    async fn find_sending_profile_by_name(
        &self,
        user_id: UserId,
        name: &str,
    ) -> Result<Option<SendingProfile>> {
        let state = self.state.lock().await;
        Ok(state
            .sending_profiles
            .values()
            .find(|p| p.user_id == user_id && p.name == name)
            .cloned())
    }

    async fn find_sms_profile_by_name(
        &self,
        user_id: UserId,
        name: &str,
    ) -> Result<Option<SmsProfile>> {
        let state = self.state.lock().await;
        Ok(state
            .sms_profiles
            .values()
            .find(|p| p.user_id == user_id && p.name == name)
            .cloned())
    }
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn get_group(&self, id: GroupId) -> Result<Option<Group>> {
        Ok(self.state.lock().await.groups.get(&id).cloned())
    }

    async fn find_group_by_name(&self, user_id: UserId, name: &str) -> Result<Option<Group>> {
        let state = self.state.lock().await;
        Ok(state
            .groups
            .values()
            .filter(|g| g.user_id == user_id && g.name == name)
            .max_by_key(|g| g.modified_date)
            .cloned())
    }

    async fn create_group_shell(
        &self,
        user_id: UserId,
        name: &str,
        group_type: &str,
    ) -> Result<Group> {
        let group = Group {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            group_type: group_type.to_string(),
            is_active: false,
            modified_date: Utc::now(),
        };
        self.state
            .lock()
            .await
            .groups
            .insert(group.id, group.clone());
        Ok(group)
    }

    async fn update_group(&self, id: GroupId, name: Option<&str>, group_type: &str) -> Result<()> {
        if let Some(group) = self.state.lock().await.groups.get_mut(&id) {
            if let Some(name) = name {
                group.name = name.to_string();
            }
            group.group_type = group_type.to_string();
            group.modified_date = Utc::now();
        }
        Ok(())
    }

    async fn set_group_active(&self, id: GroupId, active: bool) -> Result<()> {
        match self.state.lock().await.groups.get_mut(&id) {
            Some(group) => {
                group.is_active = active;
                group.modified_date = Utc::now();
                Ok(())
            }
            None => Err(hookline_common::Error::NotFound(format!("group {}", id))),
        }
    }

    async fn delete_group(&self, id: GroupId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.links.retain(|(gid, _)| *gid != id);
        state.groups.remove(&id);
        Ok(())
    }

    async fn list_targets(&self, group_id: GroupId) -> Result<Vec<Target>> {
        let state = self.state.lock().await;
        let mut targets: Vec<Target> = state
            .links
            .iter()
            .filter(|(gid, _)| *gid == group_id)
            .filter_map(|(_, tid)| state.targets.get(tid).cloned())
            .collect();
        targets.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(targets)
    }

    async fn get_targets(&self, ids: &[TargetId]) -> Result<Vec<Target>> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.targets.get(id).cloned())
            .collect())
    }

    async fn bulk_insert_targets(
        &self,
        group_id: GroupId,
        targets: &[Recipient],
    ) -> Result<BulkInsertOutcome> {
        let mut state = self.state.lock().await;
        let mut outcome = BulkInsertOutcome::default();

        for recipient in targets {
            let target_id = match state.targets_by_email.get(&recipient.email) {
                Some(id) => *id,
                None => {
                    let target = Target {
                        id: Uuid::new_v4(),
                        email: recipient.email.clone(),
                        first_name: recipient.first_name.clone(),
                        last_name: recipient.last_name.clone(),
                        position: recipient.position.clone(),
                    };
                    let id = target.id;
                    state.targets_by_email.insert(target.email.clone(), id);
                    state.targets.insert(id, target);
                    outcome.added_targets.push(id);
                    id
                }
            };

            if state.links.insert((group_id, target_id)) {
                outcome.added_links.push(target_id);
            }
        }

        Ok(outcome)
    }

    async fn delete_group_links(&self, group_id: GroupId, target_ids: &[TargetId]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        for tid in target_ids {
            if state.links.remove(&(group_id, *tid)) {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_targets(&self, ids: &[TargetId]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        for id in ids {
            if let Some(target) = state.targets.remove(id) {
                state.targets_by_email.remove(&target.email);
                state.links.retain(|(_, tid)| tid != id);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, CreateResult};
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn create_input(
        user_id: UserId,
        template_id: TemplateId,
        results: Vec<CreateResult>,
    ) -> CreateCampaign {
        let now = Utc::now();
        CreateCampaign {
            user_id,
            name: "Q3 payroll".to_string(),
            status: CampaignStatus::Queued,
            channel: Channel::Email,
            attack_objective: String::new(),
            redirect_url: String::new(),
            url: "https://lure.example.com".to_string(),
            landing_url: String::new(),
            qr_size: String::new(),
            template_id,
            page_id: None,
            smtp_id: None,
            sms_id: None,
            created_date: now,
            launch_date: now,
            send_by_date: None,
            scheduled_stop_date: None,
            results,
        }
    }

    fn due_result(email: &str, send_date: DateTime<Utc>) -> CreateResult {
        CreateResult {
            r_id: format!("rid-{}", email),
            recipient: Recipient::new(email),
            send_date,
            processing: false,
        }
    }

    async fn seeded_store(count: usize) -> (Arc<MemoryStore>, Campaign) {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        let template = store.insert_template(user, "lure", "Hi", "body", "").await;
        let past = Utc::now() - Duration::minutes(5);
        let results = (0..count)
            .map(|i| due_result(&format!("user{}@example.com", i), past))
            .collect();
        let campaign = store
            .create_campaign(create_input(user, template.id, results))
            .await
            .unwrap();
        (store, campaign)
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_overlap() {
        let (store, _) = seeded_store(200).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_due(Utc::now()).await.unwrap()
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for unit in handle.await.unwrap() {
                assert!(unit.processing);
                assert!(seen.insert(unit.id), "unit {} claimed twice", unit.id);
                total += 1;
            }
        }
        assert_eq!(total, 200);
        assert!(store.get_queued(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_units_reports_only_changed() {
        let (store, campaign) = seeded_store(3).await;
        let ids: Vec<_> = store
            .list_for_campaign(campaign.id)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();

        assert_eq!(store.lock_units(&ids[..2], true).await.unwrap().len(), 2);
        assert_eq!(store.lock_units(&ids, true).await.unwrap(), vec![ids[2]]);
        assert_eq!(store.lock_units(&ids[..1], false).await.unwrap(), vec![ids[0]]);
        assert_eq!(store.get_queued(Utc::now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_launch_take_over_is_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        let template = store.insert_template(user, "lure", "Hi", "body", "").await;
        let now = Utc::now();
        let results = vec![
            CreateResult {
                processing: true,
                ..due_result("a@example.com", now)
            },
            CreateResult {
                processing: true,
                ..due_result("b@example.com", now)
            },
            due_result("c@example.com", now + Duration::minutes(30)),
        ];
        let campaign = store
            .create_campaign(create_input(user, template.id, results))
            .await
            .unwrap();
        assert_eq!(store.pending_launches().await.unwrap(), vec![campaign.id]);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let created = campaign.created_date;
            handles.push(tokio::spawn(async move {
                store.take_over_launch(campaign.id, created).await.unwrap()
            }));
        }
        let mut won = Vec::new();
        for handle in handles {
            won.extend(handle.await.unwrap());
        }

        assert_eq!(won.len(), 2);
        assert!(store.pending_launches().await.unwrap().is_empty());
        assert!(store
            .take_over_launch(campaign.id, campaign.created_date)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_future_units_are_not_queued() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let template = store.insert_template(user, "lure", "Hi", "body", "").await;
        let now = Utc::now();
        let results = vec![
            due_result("a@example.com", now - Duration::minutes(1)),
            due_result("b@example.com", now + Duration::minutes(30)),
        ];
        store
            .create_campaign(create_input(user, template.id, results))
            .await
            .unwrap();

        let queued = store.get_queued(now).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].email, "a@example.com");
    }

    #[tokio::test]
    async fn test_outcome_callbacks_update_results() {
        let (store, campaign) = seeded_store(3).await;
        let units = store.claim_due(Utc::now()).await.unwrap();

        store.mark_success(&units[0]).await.unwrap();
        store.mark_error(&units[1]).await.unwrap();
        let next = Utc::now() + Duration::minutes(2);
        store.backoff(&units[2], next).await.unwrap();

        let remaining = store.list_for_campaign(campaign.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].send_attempt, 1);
        assert!(!remaining[0].processing);
        assert_eq!(remaining[0].send_date, next);

        let statuses: HashMap<String, String> = store
            .list_results(campaign.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.r_id, r.status))
            .collect();
        assert_eq!(statuses[&units[0].r_id], "sent");
        assert_eq!(statuses[&units[1].r_id], "error");
        assert_eq!(statuses[&units[2].r_id], "retrying");
    }

    #[tokio::test]
    async fn test_complete_keeps_first_completed_date() {
        let (store, campaign) = seeded_store(2).await;
        let first = Utc::now();

        let done = store.complete_campaign(campaign.id, first).await.unwrap().unwrap();
        assert_eq!(done.status, "complete");
        assert!(store.list_for_campaign(campaign.id).await.unwrap().is_empty());

        let again = store
            .complete_campaign(campaign.id, first + Duration::hours(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.completed_date, Some(first));
    }

    #[tokio::test]
    async fn test_bulk_insert_reuses_targets_by_email() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let first = store.create_group_shell(user, "first", "").await.unwrap();
        let second = store.create_group_shell(user, "second", "").await.unwrap();
        let people = vec![Recipient::new("a@example.com"), Recipient::new("b@example.com")];

        let one = store.bulk_insert_targets(first.id, &people).await.unwrap();
        assert_eq!(one.added_targets.len(), 2);
        assert_eq!(one.added_links.len(), 2);

        let two = store.bulk_insert_targets(second.id, &people).await.unwrap();
        assert!(two.added_targets.is_empty());
        assert_eq!(two.added_links.len(), 2);

        let again = store.bulk_insert_targets(second.id, &people).await.unwrap();
        assert_eq!(again, BulkInsertOutcome::default());
        assert_eq!(store.link_count().await, 4);
    }
}
