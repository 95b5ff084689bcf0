//! Diesel schema definitions for the fleet registry and query tables.
//!
//! The DDL lives in `migrations/schema.sql`; keep both in step.

diesel::table! {
    use diesel::sql_types::*;

    nodes (id) {
        id -> Int8,
        node_key -> Text,
        uuid -> Text,
        platform -> Text,
        platform_version -> Text,
        agent_version -> Text,
        hostname -> Text,
        localname -> Text,
        ip_address -> Text,
        username -> Text,
        agent_user -> Text,
        environment -> Text,
        cpu -> Text,
        memory -> Text,
        hardware_serial -> Text,
        daemon_hash -> Text,
        config_hash -> Text,
        raw_enrollment -> Nullable<Jsonb>,
        last_status -> Nullable<Timestamptz>,
        last_result -> Nullable<Timestamptz>,
        last_config -> Nullable<Timestamptz>,
        last_query_read -> Nullable<Timestamptz>,
        last_query_write -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    archived_nodes (id) {
        id -> Int8,
        #[sql_name = "trigger"]
        archive_trigger -> Text,
        node_key -> Text,
        uuid -> Text,
        platform -> Text,
        platform_version -> Text,
        agent_version -> Text,
        hostname -> Text,
        localname -> Text,
        ip_address -> Text,
        username -> Text,
        agent_user -> Text,
        environment -> Text,
        cpu -> Text,
        memory -> Text,
        hardware_serial -> Text,
        daemon_hash -> Text,
        config_hash -> Text,
        raw_enrollment -> Nullable<Jsonb>,
        last_status -> Nullable<Timestamptz>,
        last_result -> Nullable<Timestamptz>,
        last_config -> Nullable<Timestamptz>,
        last_query_read -> Nullable<Timestamptz>,
        last_query_write -> Nullable<Timestamptz>,
        enrolled_at -> Timestamptz,
        archived_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    node_history_hostname (id) {
        id -> Int8,
        uuid -> Text,
        value -> Text,
        count -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    node_history_localname (id) {
        id -> Int8,
        uuid -> Text,
        value -> Text,
        count -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    node_history_ipaddress (id) {
        id -> Int8,
        uuid -> Text,
        value -> Text,
        count -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    node_history_username (id) {
        id -> Int8,
        uuid -> Text,
        value -> Text,
        count -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    distributed_queries (id) {
        id -> Int8,
        name -> Text,
        creator -> Text,
        query -> Text,
        executions -> Int4,
        errors -> Int4,
        expected -> Int4,
        active -> Bool,
        completed -> Bool,
        deleted -> Bool,
        repeat_interval -> Int4,
        #[sql_name = "type"]
        query_type -> Text,
        path -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    distributed_query_targets (id) {
        id -> Int8,
        name -> Text,
        #[sql_name = "type"]
        target_type -> Text,
        value -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    distributed_query_executions (id) {
        id -> Int8,
        name -> Text,
        uuid -> Text,
        result -> Int4,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    admin_users (id) {
        id -> Int8,
        username -> Text,
        email -> Text,
        fullname -> Text,
        admin -> Bool,
        permissions -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
