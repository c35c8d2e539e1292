use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for the job store and queue
    pub redis_url: String,

    /// Key prefix for job records and status indexes
    #[serde(default = "default_job_key_prefix")]
    pub job_key_prefix: String,

    /// Job record lifetime in seconds; 0 keeps records forever
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,

    #[serde(default = "default_queue_stream")]
    pub queue_stream: String,

    #[serde(default = "default_queue_subject")]
    pub queue_subject: String,

    /// Durable consumer group name
    #[serde(default = "default_queue_consumer")]
    pub queue_consumer: String,

    /// Redeliveries allowed after the first attempt
    #[serde(default = "default_queue_max_retry")]
    pub queue_max_retry: u32,

    #[serde(default = "default_queue_max_in_flight")]
    pub queue_max_in_flight: usize,

    /// Seconds before an unacknowledged message is redelivered
    #[serde(default = "default_queue_ack_wait_secs")]
    pub queue_ack_wait_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_job_key_prefix() -> String {
    "image_jobs".to_string()
}

fn default_job_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_queue_stream() -> String {
    "IMAGE_JOBS".to_string()
}

fn default_queue_subject() -> String {
    "jobs.image".to_string()
}

fn default_queue_consumer() -> String {
    "image-workers".to_string()
}

fn default_queue_max_retry() -> u32 {
    3
}

fn default_queue_max_in_flight() -> usize {
    100
}

fn default_queue_ack_wait_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
