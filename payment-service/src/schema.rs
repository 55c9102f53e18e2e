diesel::table! {
    payment_accounts (user_id) {
        user_id -> Varchar,
        balance -> Numeric,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    processed_transactions (transaction_id) {
        transaction_id -> Uuid,
        user_id -> Varchar,
        amount -> Numeric,
        processed_at -> Timestamptz,
    }
}

diesel::table! {
    rejected_transactions (transaction_id) {
        transaction_id -> Uuid,
        reason -> Text,
        rejected_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    payment_accounts,
    processed_transactions,
    rejected_transactions,
);
