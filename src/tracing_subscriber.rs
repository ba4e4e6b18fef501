pub fn init() {
    #[cfg(feature = "tracing-subscriber")]
    {
        use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

        FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish()
            .init();
    }
}
