use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::types::format_timestamp;
use super::*;

impl PipelineDb {
    // =========================================================================
    // Users & organizations
    // =========================================================================

    /// Look up a user together with their organization's email domain.
    pub fn get_user(&self, user_id: &str) -> Result<Option<DbUser>, DbError> {
        let conn = self.conn();
        let user = conn
            .query_row(
                "SELECT u.id, u.organization_id, u.email, o.domain
                 FROM users u
                 LEFT JOIN organizations o ON o.id = u.organization_id
                 WHERE u.id = ?1",
                params![user_id],
                |row| {
                    Ok(DbUser {
                        id: row.get(0)?,
                        organization_id: row.get(1)?,
                        email: row.get(2)?,
                        organization_domain: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// All user IDs, for the scheduled poller.
    pub fn list_user_ids(&self) -> Result<Vec<String>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM users ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Get an account by ID.
    pub fn get_account(&self, id: &str) -> Result<Option<DbAccount>, DbError> {
        let conn = self.conn();
        let account = conn
            .query_row(
                "SELECT id, organization_id, name, website, updated_at
                 FROM accounts WHERE id = ?1",
                params![id],
                Self::map_account_row,
            )
            .optional()?;
        Ok(account)
    }

    /// All accounts of an organization with their opportunities.
    ///
    /// Accounts are ordered by name then ID, opportunities likewise, so the
    /// matcher's "first wins" rules are stable across runs.
    pub fn get_accounts_with_opportunities(
        &self,
        organization_id: &str,
    ) -> Result<Vec<AccountWithOpportunities>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.organization_id, a.name, a.website, a.updated_at,
                    o.id, o.name
             FROM accounts a
             LEFT JOIN opportunities o ON o.account_id = a.id
             WHERE a.organization_id = ?1
             ORDER BY a.name, a.id, o.name, o.id",
        )?;
        let mut rows = stmt.query(params![organization_id])?;

        let mut result: Vec<AccountWithOpportunities> = Vec::new();
        while let Some(row) = rows.next()? {
            let account_id: String = row.get(0)?;
            let opportunity = match row.get::<_, Option<String>>(5)? {
                Some(id) => Some(OpportunityRef {
                    id,
                    name: row.get(6)?,
                }),
                None => None,
            };

            let same_account = result
                .last()
                .map(|last| last.account.id == account_id)
                .unwrap_or(false);
            if !same_account {
                result.push(AccountWithOpportunities {
                    account: Self::map_account_row(row)?,
                    opportunities: Vec::new(),
                });
            }
            if let (Some(opp), Some(last)) = (opportunity, result.last_mut()) {
                last.opportunities.push(opp);
            }
        }
        Ok(result)
    }

    /// Set an account's website. Returns the account as it was before the
    /// write, or `None` when the account doesn't exist.
    pub fn update_account_website(
        &self,
        id: &str,
        website: Option<&str>,
    ) -> Result<Option<DbAccount>, DbError> {
        self.with_transaction(|conn| {
            let previous = conn
                .query_row(
                    "SELECT id, organization_id, name, website, updated_at
                     FROM accounts WHERE id = ?1",
                    params![id],
                    Self::map_account_row,
                )
                .optional()?;
            if previous.is_none() {
                return Ok(None);
            }
            conn.execute(
                "UPDATE accounts SET website = ?1, updated_at = ?2 WHERE id = ?3",
                params![website, format_timestamp(&Utc::now()), id],
            )?;
            Ok(previous)
        })
    }

    /// Helper: map a row to `DbAccount`.
    pub(crate) fn map_account_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbAccount> {
        Ok(DbAccount {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            name: row.get(2)?,
            website: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::{seed_account, seed_opportunity, seed_org, test_db};

    #[test]
    fn test_get_user_joins_org_domain() {
        let db = test_db();
        seed_org(&db, "org1", "seller.io", "u1");
        let user = db.get_user("u1").unwrap().expect("user exists");
        assert_eq!(user.email, "me@seller.io");
        assert_eq!(user.organization_domain.as_deref(), Some("seller.io"));
        assert!(db.get_user("missing").unwrap().is_none());
    }

    #[test]
    fn test_accounts_with_opportunities_grouping_and_order() {
        let db = test_db();
        seed_org(&db, "org1", "seller.io", "u1");
        seed_account(&db, "org1", "a2", "Zeta", Some("zeta.com"));
        seed_account(&db, "org1", "a1", "Acme", Some("https://acme.com"));
        seed_opportunity(&db, "a1", "o2", "Renewal");
        seed_opportunity(&db, "a1", "o1", "Expansion");

        let accounts = db.get_accounts_with_opportunities("org1").unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].account.name, "Acme");
        let names: Vec<&str> = accounts[0]
            .opportunities
            .iter()
            .map(|o| o.name.as_str())
            .collect();
        assert_eq!(names, vec!["Expansion", "Renewal"]);
        assert!(accounts[1].opportunities.is_empty());
    }

    #[test]
    fn test_update_account_website_returns_previous() {
        let db = test_db();
        seed_org(&db, "org1", "seller.io", "u1");
        seed_account(&db, "org1", "a1", "Acme", None);

        let previous = db
            .update_account_website("a1", Some("https://www.acme.com"))
            .unwrap()
            .expect("account exists");
        assert!(previous.website.is_none());
        let current = db.get_account("a1").unwrap().unwrap();
        assert_eq!(current.website.as_deref(), Some("https://www.acme.com"));

        assert!(db.update_account_website("nope", None).unwrap().is_none());
    }
}
