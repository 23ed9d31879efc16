use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Activity type categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    TurnReceived,
    RetrievalExecuted,
    RetrievalSkipped,
    RetrievalDegraded,
    GenerationFailed,
    TurnCompleted,
    CitationOutOfRange,
    ThemeRecorded,
    PersistenceFailed,
    HistoryRecovered,
    SessionCreated,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TurnReceived => "turn_received",
            Self::RetrievalExecuted => "retrieval_executed",
            Self::RetrievalSkipped => "retrieval_skipped",
            Self::RetrievalDegraded => "retrieval_degraded",
            Self::GenerationFailed => "generation_failed",
            Self::TurnCompleted => "turn_completed",
            Self::CitationOutOfRange => "citation_out_of_range",
            Self::ThemeRecorded => "theme_recorded",
            Self::PersistenceFailed => "persistence_failed",
            Self::HistoryRecovered => "history_recovered",
            Self::SessionCreated => "session_created",
        }
    }
}

/// Activity status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Error,
    Warning,
    Info,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// One activity entry of a turn.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityLog {
    pub turn_id: String,
    pub conversation_id: String,
    pub activity_type: ActivityType,
    pub activity_status: ActivityStatus,

    pub message_content: Option<String>,
    pub response_content: Option<String>,

    pub token_count: Option<usize>,
    pub link_count: Option<usize>,
    pub target_overlap: Option<f32>,

    pub processing_time_ms: Option<u64>,
    pub llm_call_duration_ms: Option<u64>,
    pub retrieval_duration_ms: Option<u64>,

    pub error_message: Option<String>,
    pub error_type: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Map::is_empty")]
    pub custom_fields: Map<String, Value>,
}

impl ActivityLog {
    pub fn builder(
        turn_id: impl Into<String>,
        conversation_id: impl Into<String>,
        activity_type: ActivityType,
    ) -> ActivityLogBuilder {
        ActivityLogBuilder::new(turn_id.into(), conversation_id.into(), activity_type)
    }
}

/// Builder pattern for ActivityLog
pub struct ActivityLogBuilder {
    log: ActivityLog,
}

impl ActivityLogBuilder {
    pub fn new(turn_id: String, conversation_id: String, activity_type: ActivityType) -> Self {
        Self {
            log: ActivityLog {
                turn_id,
                conversation_id,
                activity_type,
                activity_status: ActivityStatus::Success,
                message_content: None,
                response_content: None,
                token_count: None,
                link_count: None,
                target_overlap: None,
                processing_time_ms: None,
                llm_call_duration_ms: None,
                retrieval_duration_ms: None,
                error_message: None,
                error_type: None,
                created_at: Utc::now(),
                custom_fields: Map::new(),
            },
        }
    }

    pub fn status(mut self, status: ActivityStatus) -> Self {
        self.log.activity_status = status;
        self
    }

    pub fn message(mut self, content: impl Into<String>) -> Self {
        self.log.message_content = Some(content.into());
        self
    }

    pub fn response(mut self, content: impl Into<String>) -> Self {
        self.log.response_content = Some(content.into());
        self
    }

    pub fn token_count(mut self, count: usize) -> Self {
        self.log.token_count = Some(count);
        self
    }

    pub fn link_count(mut self, count: usize) -> Self {
        self.log.link_count = Some(count);
        self
    }

    pub fn target_overlap(mut self, f1: f32) -> Self {
        self.log.target_overlap = Some(f1);
        self
    }

    pub fn processing_time(mut self, ms: u64) -> Self {
        self.log.processing_time_ms = Some(ms);
        self
    }

    pub fn llm_duration(mut self, ms: u64) -> Self {
        self.log.llm_call_duration_ms = Some(ms);
        self
    }

    pub fn retrieval_duration(mut self, ms: u64) -> Self {
        self.log.retrieval_duration_ms = Some(ms);
        self
    }

    /// Marks the entry as an error.
    pub fn error(mut self, message: impl Into<String>, error_type: impl Into<String>) -> Self {
        self.log.error_message = Some(message.into());
        self.log.error_type = Some(error_type.into());
        self.log.activity_status = ActivityStatus::Error;
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.log.custom_fields.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> ActivityLog {
        self.log
    }
}
