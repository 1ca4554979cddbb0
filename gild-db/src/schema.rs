pub mod triage_schema {
    pub mod triage {
        diesel::table! {
            triage.groupings (grouping_id) {
                grouping_id -> Bytea,
                keys -> Jsonb,
            }
        }

        diesel::table! {
            triage.expectations (grouping_id, digest) {
                grouping_id -> Bytea,
                digest -> Bytea,
                label -> Text,
                expectation_record_id -> Nullable<Uuid>,
            }
        }

        diesel::table! {
            triage.expectation_records (expectation_record_id) {
                expectation_record_id -> Uuid,
                branch_name -> Nullable<Text>,
                user_name -> Text,
                triage_time -> Timestamp,
                num_changes -> Int4,
            }
        }

        diesel::table! {
            triage.expectation_deltas (expectation_record_id, grouping_id, digest) {
                expectation_record_id -> Uuid,
                grouping_id -> Bytea,
                digest -> Bytea,
                label_before -> Text,
                label_after -> Text,
            }
        }

        diesel::table! {
            triage.secondary_branch_expectations (branch_name, grouping_id, digest) {
                branch_name -> Text,
                grouping_id -> Bytea,
                digest -> Bytea,
                label -> Text,
                expectation_record_id -> Uuid,
            }
        }

        diesel::table! {
            triage.expectation_undos (id) {
                id -> Int8,
                expectation_record_id -> Text,
                user_id -> Text,
                ts -> Timestamp,
            }
        }

        diesel::allow_tables_to_appear_in_same_query!(
            groupings,
            expectations,
            expectation_records,
            expectation_deltas,
            secondary_branch_expectations,
        );
    }
}

pub mod data_schema {
    pub mod data {
        diesel::table! {
            data.traces (trace_id) {
                trace_id -> Bytea,
                corpus -> Text,
                grouping_id -> Bytea,
                keys -> Jsonb,
                matches_any_ignore_rule -> Nullable<Bool>,
            }
        }

        diesel::table! {
            data.values_at_head (trace_id) {
                trace_id -> Bytea,
                most_recent_commit_id -> Text,
                digest -> Bytea,
                grouping_id -> Bytea,
                corpus -> Text,
                keys -> Jsonb,
                matches_any_ignore_rule -> Nullable<Bool>,
            }
        }

        diesel::table! {
            data.tiled_trace_digests (trace_id, tile_id, digest) {
                trace_id -> Bytea,
                tile_id -> Int4,
                digest -> Bytea,
            }
        }

        diesel::table! {
            data.commits_with_data (commit_id) {
                commit_id -> Text,
                tile_id -> Int4,
            }
        }

        diesel::allow_tables_to_appear_in_same_query!(
            traces,
            values_at_head,
            tiled_trace_digests,
            commits_with_data,
        );
    }
}
