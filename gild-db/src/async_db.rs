use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

/// Async variant of the commit-window lookup used on the serving path: the
/// oldest commit (and its tile) inside the most recent `window` commits
/// that have data.
pub async fn window_first_commit(
    conn: &mut AsyncPgConnection,
    window: usize,
) -> QueryResult<Option<(String, i32)>> {
    use crate::data_schema::data::commits_with_data::dsl;

    dsl::commits_with_data
        .select((dsl::commit_id, dsl::tile_id))
        .order_by(dsl::commit_id.desc())
        .limit(window as i64)
        .load::<(String, i32)>(conn)
        .await
        .map(|commits| commits.into_iter().last())
}
