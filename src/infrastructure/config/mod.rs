mod settings;

pub use settings::{
    ApiConfig, BrokerConfig, DatabaseConfig, JwtConfig, OtelConfig, PresenceConfig, RedisConfig,
    ServerConfig, Settings, WebSocketConfig,
};
