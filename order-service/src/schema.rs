diesel::table! {
    orders (transaction_id) {
        transaction_id -> Uuid,
        user_id -> Varchar,
        amount -> Numeric,
        order_status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    transaction_outbox (transaction_id) {
        transaction_id -> Uuid,
        user_id -> Varchar,
        amount -> Numeric,
        dispatch_status -> Varchar,
        attempts -> Int4,
        last_error -> Nullable<Text>,
        next_attempt_at -> Timestamptz,
        claimed_until -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        dispatched_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(transaction_outbox -> orders (transaction_id));

diesel::allow_tables_to_appear_in_same_query!(
    orders,
    transaction_outbox,
);
