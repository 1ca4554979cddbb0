use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::triage_schema::triage::groupings)]
pub struct NewGrouping<'a> {
    pub grouping_id: &'a [u8],
    pub keys: &'a serde_json::Value,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = crate::triage_schema::triage::groupings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbGrouping {
    pub grouping_id: Vec<u8>,
    pub keys: serde_json::Value,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::triage_schema::triage::expectations)]
pub struct NewExpectation<'a> {
    pub grouping_id: &'a [u8],
    pub digest: &'a [u8],
    pub label: &'a str,
    pub expectation_record_id: Option<Uuid>,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = crate::triage_schema::triage::expectations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbExpectation {
    pub grouping_id: Vec<u8>,
    pub digest: Vec<u8>,
    pub label: String,
    pub expectation_record_id: Option<Uuid>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::triage_schema::triage::expectation_records)]
pub struct NewExpectationRecord<'a> {
    pub expectation_record_id: Uuid,
    pub branch_name: Option<&'a str>,
    pub user_name: &'a str,
    pub triage_time: NaiveDateTime,
    pub num_changes: i32,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = crate::triage_schema::triage::expectation_records)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DbExpectationRecord {
    pub expectation_record_id: Uuid,
    pub branch_name: Option<String>,
    pub user_name: String,
    pub triage_time: NaiveDateTime,
    pub num_changes: i32,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::triage_schema::triage::expectation_deltas)]
pub struct NewExpectationDelta<'a> {
    pub expectation_record_id: Uuid,
    pub grouping_id: &'a [u8],
    pub digest: &'a [u8],
    pub label_before: &'a str,
    pub label_after: &'a str,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::triage_schema::triage::secondary_branch_expectations)]
pub struct NewSecondaryBranchExpectation<'a> {
    pub branch_name: &'a str,
    pub grouping_id: &'a [u8],
    pub digest: &'a [u8],
    pub label: &'a str,
    pub expectation_record_id: Uuid,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::triage_schema::triage::expectation_undos)]
pub struct NewExpectationUndo<'a> {
    pub expectation_record_id: &'a str,
    pub user_id: &'a str,
    pub ts: NaiveDateTime,
}
