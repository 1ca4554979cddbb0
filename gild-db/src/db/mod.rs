use chrono::{DateTime, Utc};
use diesel::expression::BoxableExpression;
use diesel::pg::Pg;
use diesel::sql_types::{Array, Bool, Bytea, Text};
use diesel::upsert::excluded;
use diesel::{PgConnection, prelude::*, sql_query};
use hashbrown::HashMap;
use itertools::Itertools;
use log::warn;
use uuid::Uuid;

use crate::models::{NewExpectation, NewExpectationDelta, NewExpectationRecord, NewExpectationUndo, NewSecondaryBranchExpectation};
use gild_types::Label;

/// How often a transaction that lost a serialization race is retried before
/// the error is handed to the caller.
const MAX_TXN_ATTEMPTS: usize = 5;

/// Runs `f` in a transaction, retrying the whole transaction on the
/// engine's serialization-conflict error. This is the standard retry loop
/// for stores that run at serializable isolation; any other error is
/// returned as-is.
pub fn run_retryable_transaction<T, F>(conn: &mut PgConnection, mut f: F) -> QueryResult<T>
where
    F: FnMut(&mut PgConnection) -> QueryResult<T>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match conn.transaction(|conn| f(conn)) {
            Err(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::SerializationFailure,
                info,
            )) if attempt < MAX_TXN_ATTEMPTS => {
                warn!(
                    "Retrying transaction after serialization conflict (attempt {attempt}): {}",
                    info.message()
                );
            }
            other => return other,
        }
    }
}

#[derive(QueryableByName)]
struct GroupingIdByName {
    #[diesel(sql_type = Bytea)]
    grouping_id: Vec<u8>,
    #[diesel(sql_type = Text)]
    name: String,
}

/// Maps each test name to the grouping id whose `name` key matches it.
/// Names can be ambiguous (two groupings may share a name and differ in
/// other keys); the lexicographically smallest grouping id wins so the
/// mirror is at least deterministic.
pub fn resolve_grouping_ids_by_name(
    conn: &mut PgConnection,
    names: &[String],
) -> QueryResult<HashMap<String, Vec<u8>>> {
    if names.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sql_query(
        "SELECT grouping_id, keys->>'name' AS name FROM triage.groupings \
         WHERE keys->>'name' = ANY($1) ORDER BY grouping_id ASC",
    )
    .bind::<Array<Text>, _>(names)
    .load::<GroupingIdByName>(conn)?;

    let mut resolved: HashMap<String, Vec<u8>> = HashMap::new();
    for row in rows {
        if resolved.contains_key(&row.name) {
            warn!(
                "Multiple groupings share the name {:?}; mirroring against the smallest grouping id",
                row.name
            );
            continue;
        }
        resolved.insert(row.name, row.grouping_id);
    }
    Ok(resolved)
}

type PairLabels = HashMap<(Vec<u8>, Vec<u8>), Label>;

/// Reads the current primary-branch label for each `(grouping_id, digest)`
/// pair with a single composite-key OR query. Pairs with no row are simply
/// absent from the result; callers default them to untriaged.
pub fn current_master_labels(
    conn: &mut PgConnection,
    pairs: &[(Vec<u8>, Vec<u8>)],
) -> QueryResult<PairLabels> {
    use crate::triage_schema::triage::expectations::dsl;

    if pairs.is_empty() {
        return Ok(HashMap::new());
    }

    let (first_grouping, first_digest) = &pairs[0];
    let mut cond: Box<
        dyn BoxableExpression<crate::triage_schema::triage::expectations::table, Pg, SqlType = Bool> + '_,
    > = Box::new(
        dsl::grouping_id
            .eq(first_grouping.as_slice())
            .and(dsl::digest.eq(first_digest.as_slice())),
    );
    for (grouping, digest) in &pairs[1..] {
        cond = Box::new(
            cond.or(dsl::grouping_id
                .eq(grouping.as_slice())
                .and(dsl::digest.eq(digest.as_slice()))),
        );
    }

    let rows: Vec<(Vec<u8>, Vec<u8>, String)> = dsl::expectations
        .filter(cond)
        .select((dsl::grouping_id, dsl::digest, dsl::label))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|(grouping, digest, label)| ((grouping, digest), Label::from_sql_code(label.trim())))
        .collect())
}

/// One delta headed for the relational mirror, still keyed the way the
/// primary store keys it.
#[derive(Debug, Clone)]
pub struct MirrorDelta {
    pub test: String,
    pub digest: String,
    pub label: Label,
}

/// Mirrors one successful triage write into the relational store: resolves
/// test names to grouping ids, records the triage action and its per-pair
/// deltas, and upserts the current labels: into `triage.expectations` on
/// the primary branch, or `triage.secondary_branch_expectations` for a
/// changelist branch.
///
/// Deltas whose name resolves to no grouping, or whose digest is not valid
/// hex, are dropped from the mirror with a warning; they stay applied in
/// the primary store regardless. Returns the new record id, or `None` when
/// nothing was left to mirror.
pub fn mirror_triage(
    conn: &mut PgConnection,
    branch: Option<&str>,
    user: &str,
    ts: DateTime<Utc>,
    deltas: &[MirrorDelta],
) -> QueryResult<Option<Uuid>> {
    let names = deltas.iter().map(|d| d.test.clone()).unique().collect_vec();
    let grouping_ids = resolve_grouping_ids_by_name(conn, &names)?;

    let resolved = deltas
        .iter()
        .filter_map(|delta| {
            let Some(grouping_id) = grouping_ids.get(&delta.test) else {
                warn!(
                    "No grouping named {:?} in the relational store; dropping its delta from the mirror",
                    delta.test
                );
                return None;
            };
            let digest = match hex::decode(&delta.digest) {
                Ok(digest) => digest,
                Err(e) => {
                    warn!(
                        "Digest {:?} is not valid hex; dropping its delta from the mirror: {e}",
                        delta.digest
                    );
                    return None;
                }
            };
            Some((grouping_id.clone(), digest, delta.label))
        })
        .collect_vec();

    if resolved.is_empty() {
        return Ok(None);
    }

    let record_id = Uuid::new_v4();
    let pairs = resolved
        .iter()
        .map(|(grouping, digest, _)| (grouping.clone(), digest.clone()))
        .collect_vec();

    run_retryable_transaction(conn, |conn| {
        use crate::triage_schema::triage;

        NewExpectationRecord {
            expectation_record_id: record_id,
            branch_name: branch,
            user_name: user,
            triage_time: ts.naive_utc(),
            num_changes: resolved.len() as i32,
        }
        .insert_into(triage::expectation_records::table)
        .execute(conn)?;

        // The "before" label always comes from the primary branch, even for
        // changelist writes.
        let befores = current_master_labels(conn, &pairs)?;

        let delta_rows = resolved
            .iter()
            .map(|(grouping, digest, label)| NewExpectationDelta {
                expectation_record_id: record_id,
                grouping_id: grouping,
                digest,
                label_before: befores
                    .get(&(grouping.clone(), digest.clone()))
                    .copied()
                    .unwrap_or_default()
                    .sql_code(),
                label_after: label.sql_code(),
            })
            .collect_vec();
        diesel::insert_into(triage::expectation_deltas::table)
            .values(&delta_rows)
            .execute(conn)?;

        match branch {
            None => {
                use crate::triage_schema::triage::expectations::dsl;
                let rows = resolved
                    .iter()
                    .map(|(grouping, digest, label)| NewExpectation {
                        grouping_id: grouping,
                        digest,
                        label: label.sql_code(),
                        expectation_record_id: Some(record_id),
                    })
                    .collect_vec();
                diesel::insert_into(dsl::expectations)
                    .values(&rows)
                    .on_conflict((dsl::grouping_id, dsl::digest))
                    .do_update()
                    .set((
                        dsl::label.eq(excluded(dsl::label)),
                        dsl::expectation_record_id.eq(excluded(dsl::expectation_record_id)),
                    ))
                    .execute(conn)?;
            }
            Some(branch) => {
                use crate::triage_schema::triage::secondary_branch_expectations::dsl;
                let rows = resolved
                    .iter()
                    .map(|(grouping, digest, label)| NewSecondaryBranchExpectation {
                        branch_name: branch,
                        grouping_id: grouping,
                        digest,
                        label: label.sql_code(),
                        expectation_record_id: record_id,
                    })
                    .collect_vec();
                diesel::insert_into(dsl::secondary_branch_expectations)
                    .values(&rows)
                    .on_conflict((dsl::branch_name, dsl::grouping_id, dsl::digest))
                    .do_update()
                    .set((
                        dsl::label.eq(excluded(dsl::label)),
                        dsl::expectation_record_id.eq(excluded(dsl::expectation_record_id)),
                    ))
                    .execute(conn)?;
            }
        }

        Ok(())
    })?;

    Ok(Some(record_id))
}

/// Appends an undo marker for manual reconciliation. The primary store's
/// record ids are not relational record ids, so the undo cannot be joined
/// to the delta history automatically.
pub fn record_undo(
    conn: &mut PgConnection,
    original_record_id: &str,
    user: &str,
    ts: DateTime<Utc>,
) -> QueryResult<()> {
    use crate::triage_schema::triage::expectation_undos::dsl;

    NewExpectationUndo {
        expectation_record_id: original_record_id,
        user_id: user,
        ts: ts.naive_utc(),
    }
    .insert_into(dsl::expectation_undos)
    .execute(conn)
    .map(|_| ())
}
