//! Identity graph queries: unlinked-account paging, link upserts, attribute
//! candidates, and the single-statement auto-link by email.
//!
//! Accounts live in two ingest tables (app_users, idp_users); the link table
//! references them by `(account_class, account_id)`. Link rows are the
//! relation; there are no owning pointers between identities and accounts.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};

use crate::types::{
    AccountClass, AccountLink, AccountRef, IdentityAccountAttributes, IdentityRow, UnlinkedAccount,
};

/// Both account tables as one tagged relation, live rows only.
const ACCOUNT_UNION: &str = r#"
    select 'app_user' as account_class, u.id, u.source_kind, u.source_name,
           u.external_id, u.email, u.display_name
    from app_users u
    where u.expired_at is null
    union all
    select 'idp_user', u.id, u.source_kind, u.source_name,
           u.external_id, u.email, u.display_name
    from idp_users u
    where u.expired_at is null
"#;

pub(crate) async fn count_unlinked_accounts(pool: &PgPool) -> Result<i64> {
    let sql = format!(
        r#"
        select count(*)::bigint
        from ({ACCOUNT_UNION}) a
        left join identity_account_links l
          on l.account_class = a.account_class and l.account_id = a.id
        where l.account_id is null
        "#
    );

    let (n,): (i64,) = sqlx::query_as(&sql)
        .fetch_one(pool)
        .await
        .context("count_unlinked_accounts failed")?;

    Ok(n)
}

pub(crate) async fn list_unlinked_accounts_page(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<UnlinkedAccount>> {
    let sql = format!(
        r#"
        select a.account_class, a.id, a.source_kind, a.source_name,
               a.external_id, a.email, a.display_name
        from ({ACCOUNT_UNION}) a
        left join identity_account_links l
          on l.account_class = a.account_class and l.account_id = a.id
        where l.account_id is null
        order by a.account_class, a.id
        limit $1
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("list_unlinked_accounts_page failed")?;

    rows.iter()
        .map(|row| {
            Ok(UnlinkedAccount {
                account: AccountRef {
                    class: AccountClass::parse(&row.try_get::<String, _>("account_class")?)?,
                    id: row.try_get("id")?,
                },
                source_kind: row.try_get("source_kind")?,
                source_name: row.try_get("source_name")?,
                external_id: row.try_get("external_id")?,
                email: row.try_get("email")?,
                display_name: row.try_get("display_name")?,
            })
        })
        .collect()
}

pub(crate) async fn get_preferred_identity_by_primary_email(
    pool: &PgPool,
    email: &str,
) -> Result<Option<IdentityRow>> {
    let row = sqlx::query(
        r#"
        select id, primary_email, display_name
        from identities
        where primary_email = lower(btrim($1))
        order by id
        limit 1
        "#,
    )
    .bind(email)
    .fetch_optional(pool)
    .await
    .context("get_preferred_identity_by_primary_email failed")?;

    row.map(|row| {
        Ok(IdentityRow {
            id: row.try_get("id")?,
            primary_email: row.try_get("primary_email")?,
            display_name: row.try_get("display_name")?,
        })
    })
    .transpose()
}

pub(crate) async fn create_identity(
    pool: &PgPool,
    primary_email: Option<&str>,
    display_name: Option<&str>,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into identities (primary_email, display_name)
        values (lower(btrim($1)), $2)
        returning id
        "#,
    )
    .bind(primary_email)
    .bind(display_name)
    .fetch_one(pool)
    .await
    .context("create_identity failed")?;

    Ok(id)
}

pub(crate) async fn upsert_identity_account_link(
    pool: &PgPool,
    identity_id: i64,
    account: AccountRef,
    reason: &str,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        insert into identity_account_links (account_class, account_id, identity_id, reason)
        values ($1, $2, $3, $4)
        on conflict (account_class, account_id) do update
           set identity_id = excluded.identity_id,
               reason = excluded.reason
         where identity_account_links.reason <> 'manual'
        returning account_id
        "#,
    )
    .bind(account.class.as_str())
    .bind(account.id)
    .bind(identity_id)
    .bind(reason)
    .fetch_optional(pool)
    .await
    .context("upsert_identity_account_link failed")?;

    Ok(row.is_some())
}

pub(crate) async fn get_identity_account_link_by_account_id(
    pool: &PgPool,
    account: AccountRef,
) -> Result<Option<AccountLink>> {
    let row = sqlx::query(
        r#"
        select identity_id, account_class, account_id, reason
        from identity_account_links
        where account_class = $1
          and account_id = $2
        "#,
    )
    .bind(account.class.as_str())
    .bind(account.id)
    .fetch_optional(pool)
    .await
    .context("get_identity_account_link_by_account_id failed")?;

    row.map(|row| {
        Ok(AccountLink {
            identity_id: row.try_get("identity_id")?,
            account: AccountRef {
                class: AccountClass::parse(&row.try_get::<String, _>("account_class")?)?,
                id: row.try_get("account_id")?,
            },
            reason: row.try_get("reason")?,
        })
    })
    .transpose()
}

pub(crate) async fn list_authoritative_sources(
    pool: &PgPool,
) -> Result<Vec<crate::types::SourceRef>> {
    let rows = sqlx::query(
        r#"
        select source_kind, source_name
        from authoritative_sources
        order by source_kind, source_name
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_authoritative_sources failed")?;

    rows.iter()
        .map(|row| {
            Ok(crate::types::SourceRef::new(
                row.try_get::<String, _>("source_kind")?,
                row.try_get::<String, _>("source_name")?,
            ))
        })
        .collect()
}

pub(crate) async fn list_identity_account_attributes(
    pool: &PgPool,
    identity_id: i64,
) -> Result<Vec<IdentityAccountAttributes>> {
    let sql = format!(
        r#"
        select a.account_class, a.id, a.source_kind, a.source_name, a.email, a.display_name,
               (s.source_kind is not null) as is_authoritative
        from identity_account_links l
        join ({ACCOUNT_UNION}) a
          on a.account_class = l.account_class and a.id = l.account_id
        left join authoritative_sources s
          on s.source_kind = a.source_kind and s.source_name = a.source_name
        where l.identity_id = $1
        order by a.account_class, a.id
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(identity_id)
        .fetch_all(pool)
        .await
        .context("list_identity_account_attributes failed")?;

    rows.iter()
        .map(|row| {
            Ok(IdentityAccountAttributes {
                account: AccountRef {
                    class: AccountClass::parse(&row.try_get::<String, _>("account_class")?)?,
                    id: row.try_get("id")?,
                },
                source_kind: row.try_get("source_kind")?,
                source_name: row.try_get("source_name")?,
                email: row.try_get("email")?,
                display_name: row.try_get("display_name")?,
                is_authoritative: row.try_get("is_authoritative")?,
            })
        })
        .collect()
}

pub(crate) async fn update_identity_attributes(
    pool: &PgPool,
    identity_id: i64,
    primary_email: Option<&str>,
    display_name: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        update identities
           set primary_email = lower(btrim($2)),
               display_name = $3
         where id = $1
        "#,
    )
    .bind(identity_id)
    .bind(primary_email)
    .bind(display_name)
    .execute(pool)
    .await
    .context("update_identity_attributes failed")?;

    Ok(())
}

pub(crate) async fn bulk_auto_link_by_email(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
) -> Result<u64> {
    let res = sqlx::query(
        r#"
        insert into identity_account_links (account_class, account_id, identity_id, reason)
        select 'app_user', u.id, i.id, 'auto_email'
        from app_users u
        join identities i on i.primary_email = lower(btrim(u.email))
        where u.source_kind = $1
          and u.source_name = $2
          and u.expired_at is null
          and u.email is not null
          and btrim(u.email) <> ''
        on conflict (account_class, account_id) do nothing
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .execute(pool)
    .await
    .context("bulk_auto_link_by_email failed")?;

    Ok(res.rows_affected())
}
