//! Retroactive linking after an account's website changes.
//!
//! Events synced before the account had a (correct) website sit unlinked.
//! When the website changes the organization's unlinked events are re-run
//! through the matcher and only empty link columns are filled; an existing
//! link is never overwritten.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::domain::{email_domain, extract_domain};
use crate::error::PipelineError;
use crate::matcher::DomainIndex;
use crate::next_call::NextCallResolver;
use crate::repository::{AccountRepository, EventRepository};

pub struct BackfillEngine {
    accounts: Arc<dyn AccountRepository>,
    events: Arc<dyn EventRepository>,
    next_call: Option<Arc<NextCallResolver>>,
}

impl BackfillEngine {
    pub fn new(accounts: Arc<dyn AccountRepository>, events: Arc<dyn EventRepository>) -> Self {
        Self {
            accounts,
            events,
            next_call: None,
        }
    }

    /// Recalculate next call dates of opportunities that gain links.
    pub fn with_next_call(mut self, resolver: Arc<NextCallResolver>) -> Self {
        self.next_call = Some(resolver);
        self
    }

    /// Link the organization's unlinked events that include an attendee at
    /// `new_website`'s domain. Returns how many events changed.
    pub fn backfill(
        &self,
        account_id: &str,
        new_website: &str,
        organization_id: &str,
    ) -> Result<usize, PipelineError> {
        let Some(domain) = extract_domain(new_website) else {
            log::debug!("Backfill: no usable domain in '{}' for {}", new_website, account_id);
            return Ok(0);
        };

        let mut accounts = self.accounts.get_accounts_with_opportunities(organization_id)?;
        // The index must reflect the new website even if the caller hasn't
        // committed it yet.
        for entry in accounts.iter_mut() {
            if entry.account.id == account_id {
                entry.account.website = Some(new_website.to_string());
            }
        }
        let index = DomainIndex::build(accounts);

        let candidates = self.events.get_unlinked_events_for_org(organization_id)?;
        let mut self_emails: HashMap<String, String> = HashMap::new();
        let mut linked = 0;
        let mut touched: BTreeSet<String> = BTreeSet::new();

        for event in candidates {
            if !self_emails.contains_key(&event.user_id) {
                let email = self
                    .accounts
                    .get_user(&event.user_id)?
                    .map(|u| u.email)
                    .unwrap_or_default();
                self_emails.insert(event.user_id.clone(), email);
            }
            let self_email = self_emails
                .get(&event.user_id)
                .map(String::as_str)
                .unwrap_or_default();

            // The syncing user's own address never counts toward the domain.
            let at_domain = event
                .attendees
                .iter()
                .filter(|a| !a.trim().eq_ignore_ascii_case(self_email.trim()))
                .filter_map(|a| email_domain(a))
                .any(|d| d == domain);
            if !at_domain {
                continue;
            }

            let Some(result) = index.resolve(&event.attendees, self_email, &event.title) else {
                continue;
            };

            if self.events.fill_event_links(
                &event.id,
                &result.account_id,
                result.opportunity_id.as_deref(),
            )? {
                linked += 1;
                if let Some(refreshed) = self.events.get_event(&event.id)? {
                    if let Some(opp) = refreshed.opportunity_id {
                        touched.insert(opp);
                    }
                }
                log::debug!("Backfill: linked event {} to account {}", event.id, result.account_id);
            }
        }

        if let Some(resolver) = &self.next_call {
            resolver.recalculate_many(&touched);
        }

        log::info!(
            "Backfill: linked {} events for account {} ({})",
            linked,
            account_id,
            domain
        );
        Ok(linked)
    }

    /// Hook for account edits. Runs the backfill only when the derived
    /// domain changed; failures are logged and reported as zero.
    pub fn on_website_changed(
        &self,
        account_id: &str,
        old_website: Option<&str>,
        new_website: Option<&str>,
        organization_id: &str,
    ) -> usize {
        let old_domain = old_website.and_then(extract_domain);
        let new_domain = new_website.and_then(extract_domain);
        let Some(new_website) = new_website.filter(|_| new_domain.is_some()) else {
            return 0;
        };
        if old_domain == new_domain {
            return 0;
        }

        match self.backfill(account_id, new_website, organization_id) {
            Ok(linked) => linked,
            Err(e) => {
                log::warn!("Backfill: failed for account {}: {}", account_id, e);
                0
            }
        }
    }
}
