use std::sync::Arc;

use redis::aio::ConnectionManager;

use super::{config::Config, database::init_redis, ws::Rooms};

pub struct AppState {
    pub config: Config,
    pub redis: ConnectionManager,
    pub rooms: Rooms,
}

impl AppState {
    pub async fn new() -> Arc<Self> {
        let config = Config::load();

        let redis = init_redis(&config.redis_url).await;

        Arc::new(Self {
            config,
            redis,
            rooms: Rooms::default(),
        })
    }
}
