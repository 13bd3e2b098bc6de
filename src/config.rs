use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub db_max_connections: u32,
    /// Reward credited to every new referral.
    #[serde(default = "default_reward_amount")]
    pub reward_amount: Decimal,
    /// Registering with this email yields an administrator account.
    #[serde(default)]
    pub admin_email: Option<String>,
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
}

fn default_max_connections() -> u32 {
    8
}

fn default_reward_amount() -> Decimal {
    Decimal::new(40000, 2)
}

fn default_session_cookie() -> String {
    "sid".to_string()
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .set_default("server_port", 8000)?
            .add_source(config::Environment::default())
            .build()?;
        config.try_deserialize()
    }

    /// Whether `email` is the configured administrator address.
    pub fn is_admin_email(&self, email: &str) -> bool {
        self.admin_email
            .as_deref()
            .is_some_and(|admin| admin.eq_ignore_ascii_case(email))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 8000,
            database_url: String::new(),
            db_max_connections: default_max_connections(),
            reward_amount: default_reward_amount(),
            admin_email: None,
            session_cookie: default_session_cookie(),
        }
    }
}
