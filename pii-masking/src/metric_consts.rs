pub const RECORDS_RECEIVED: &str = "pii_masking_records_received";
pub const RECORDS_MASKED: &str = "pii_masking_records_masked";
pub const FIELDS_MASKED: &str = "pii_masking_fields_masked";
pub const MASKING_FAILURES: &str = "pii_masking_masking_failures";
pub const DLP_CALL_TIME: &str = "pii_masking_dlp_call_time_ms";
pub const ROWS_WRITTEN: &str = "pii_masking_rows_written";
pub const ROWS_FAILED: &str = "pii_masking_rows_failed";
pub const SINK_RETRIES: &str = "pii_masking_sink_retries";
pub const SINK_ROW_FALLBACK: &str = "pii_masking_sink_row_fallback";
pub const SINK_WRITE_TIME: &str = "pii_masking_sink_write_time_ms";
pub const DEAD_LETTERS_ROUTED: &str = "pii_masking_dead_letters_routed";
pub const DEAD_LETTER_PRODUCE_ERRORS: &str = "pii_masking_dead_letter_produce_errors";
pub const BATCH_SIZE: &str = "pii_masking_batch_size";
pub const BATCH_PROCESS_TIME: &str = "pii_masking_batch_process_time_ms";
pub const WORKER_RECV_ERRORS: &str = "pii_masking_worker_recv_errors";
pub const WORKER_OFFSET_STORE_ERRORS: &str = "pii_masking_worker_offset_store_errors";
