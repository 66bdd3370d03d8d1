//! Identity resolution: link unlinked accounts to identities, then
//! recompute each touched identity's canonical attributes.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use sspm_store::{Store, LINK_REASON_AUTO_CREATE, LINK_REASON_AUTO_EMAIL};

use crate::contract::normalize_email;
use crate::error::Canceled;
use crate::event::{Event, Reporter};

const PAGE_SIZE: i64 = 200;

/// Repeatedly page unlinked accounts and assign each to an identity:
/// matched by preferred email (`auto_email`) or freshly created
/// (`auto_create`). Manual links are never touched: they are excluded from
/// the unlinked set and the link upsert refuses to overwrite them. After
/// linking, canonical attributes are recomputed per touched identity.
pub async fn resolve_identities(
    store: &Arc<dyn Store>,
    reporter: &Arc<dyn Reporter>,
    cancel: &CancellationToken,
) -> Result<()> {
    let total = store
        .count_unlinked_accounts()
        .await
        .context("count unlinked accounts failed")?;
    reporter.report(Event::progress("identity", "resolve", 0, total));

    let mut processed: i64 = 0;
    let mut touched: BTreeSet<i64> = BTreeSet::new();

    loop {
        if cancel.is_cancelled() {
            return Err(Canceled.into());
        }

        let page = store
            .list_unlinked_accounts_page(PAGE_SIZE)
            .await
            .context("list unlinked accounts failed")?;
        if page.is_empty() {
            break;
        }

        let before = processed;
        for account in page {
            let email = account.email.as_deref().and_then(normalize_email);

            let (identity_id, reason) = match &email {
                Some(email) => match store.get_preferred_identity_by_primary_email(email).await? {
                    Some(identity) => (identity.id, LINK_REASON_AUTO_EMAIL),
                    None => {
                        let id = store
                            .create_identity(Some(email), account.display_name.as_deref())
                            .await?;
                        (id, LINK_REASON_AUTO_CREATE)
                    }
                },
                None => {
                    let id = store
                        .create_identity(None, account.display_name.as_deref())
                        .await?;
                    (id, LINK_REASON_AUTO_CREATE)
                }
            };

            store
                .upsert_identity_account_link(identity_id, account.account, reason)
                .await?;
            touched.insert(identity_id);

            processed += 1;
            reporter.report(Event::progress("identity", "resolve", processed, total));
        }

        // Every fetched account gets linked, so the first page shrinks each
        // round; bail if it somehow didn't.
        if processed == before {
            break;
        }
    }

    for identity_id in touched {
        recompute_attributes(store, identity_id).await?;
    }

    reporter.report(Event::done("identity", "resolve"));
    Ok(())
}

/// Pick canonical attributes across an identity's linked accounts:
/// authoritative sources first, then accounts that have an email, then the
/// lowest account id as the deterministic tiebreaker.
async fn recompute_attributes(store: &Arc<dyn Store>, identity_id: i64) -> Result<()> {
    let mut attrs = store
        .list_identity_account_attributes(identity_id)
        .await
        .context("list identity account attributes failed")?;
    if attrs.is_empty() {
        return Ok(());
    }

    attrs.sort_by_key(|a| (!a.is_authoritative, a.email.is_none(), a.account.id));

    let best = &attrs[0];
    let email = best.email.as_deref().and_then(normalize_email);
    debug!(
        identity_id,
        source_kind = %best.source_kind,
        source_name = %best.source_name,
        "identity attributes recomputed"
    );
    store
        .update_identity_attributes(identity_id, email.as_deref(), best.display_name.as_deref())
        .await
        .context("update identity attributes failed")?;

    Ok(())
}
