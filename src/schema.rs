// Stratum schema - metadata tables for Diesel ORM
//
// Data tables (raw_*, str_*, cur_*, acc_*) are created dynamically from
// observed file shapes and are accessed through raw SQL; only the three
// durable metadata tables get static declarations.

diesel::table! {
    file_ingestion_metadata (file_id) {
        file_id -> Text,
        file_path -> Text,
        file_name -> Text,
        source_type -> Text,
        file_hash -> Text,
        file_size_bytes -> BigInt,
        row_count -> Integer,
        ingested_at -> Text,
        processing_status -> Text,
        error_message -> Nullable<Text>,
    }
}

diesel::table! {
    schema_version_tracking (schema_id) {
        schema_id -> Text,
        table_name -> Text,
        schema_version -> Integer,
        column_definitions -> Text,
        previous_version_id -> Nullable<Text>,
        change_description -> Text,
        recorded_at -> Text,
    }
}

diesel::table! {
    layer_build_runs (run_id) {
        run_id -> Text,
        layer_name -> Text,
        started_at -> Text,
        mode -> Text,
        rows_before -> Integer,
        rows_after -> Integer,
        new_upstream_count -> Integer,
        tests_passed -> Nullable<Integer>,
        duration_ms -> Integer,
        status -> Text,
        error_message -> Nullable<Text>,
    }
}
