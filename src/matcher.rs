//! Attendee → account/opportunity resolution.
//!
//! Strategy:
//! 1. Index every account of the organization by the domain of its website.
//!    The index is built once per sync or backfill pass and dropped with it.
//! 2. Walk the event's attendees in order, skipping the syncing user. The
//!    first attendee whose domain is indexed decides the account.
//! 3. Pick the opportunity: a lone opportunity links directly; several are
//!    disambiguated by a case-insensitive substring match against the title.

use std::collections::HashMap;

use crate::db::AccountWithOpportunities;
use crate::domain::{email_domain, extract_domain};

/// Links resolved for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub account_id: String,
    pub opportunity_id: Option<String>,
}

/// Domain → account lookup for one organization.
pub struct DomainIndex {
    accounts: Vec<AccountWithOpportunities>,
    by_domain: HashMap<String, usize>,
}

impl DomainIndex {
    /// Build from accounts in index order (name, then id). When several
    /// accounts share a domain the first one keeps it.
    pub fn build(accounts: Vec<AccountWithOpportunities>) -> Self {
        let mut by_domain = HashMap::new();
        for (idx, entry) in accounts.iter().enumerate() {
            if let Some(domain) = entry.account.website.as_deref().and_then(extract_domain) {
                by_domain.entry(domain).or_insert(idx);
            }
        }
        Self {
            accounts,
            by_domain,
        }
    }

    pub fn len(&self) -> usize {
        self.by_domain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_domain.is_empty()
    }

    /// Account indexed under `domain`, if any.
    pub fn account_for_domain(&self, domain: &str) -> Option<&AccountWithOpportunities> {
        self.by_domain
            .get(domain)
            .and_then(|idx| self.accounts.get(*idx))
    }

    /// Resolve an event's links. `None` when no attendee maps to an account.
    pub fn resolve(&self, attendees: &[String], self_email: &str, title: &str) -> Option<MatchResult> {
        let entry = attendees
            .iter()
            .filter(|a| !a.trim().eq_ignore_ascii_case(self_email.trim()))
            .filter_map(|a| email_domain(a))
            .find_map(|domain| self.account_for_domain(&domain))?;

        Some(MatchResult {
            account_id: entry.account.id.clone(),
            opportunity_id: choose_opportunity(entry, title),
        })
    }
}

/// Pick an opportunity within the matched account.
///
/// Ambiguity is not an error: no title match leaves the opportunity unset.
fn choose_opportunity(entry: &AccountWithOpportunities, title: &str) -> Option<String> {
    match entry.opportunities.as_slice() {
        [] => None,
        [only] => Some(only.id.clone()),
        many => {
            let title = title.trim().to_lowercase();
            if title.is_empty() {
                return None;
            }
            many.iter()
                .find(|opp| {
                    let name = opp.name.trim().to_lowercase();
                    !name.is_empty() && (title.contains(&name) || name.contains(&title))
                })
                .map(|opp| opp.id.clone())
        }
    }
}
