use kiln::plugins::Plugin;
use tracing::info;

/// Hello World Plugin - A minimal example plugin for Kiln
#[derive(Default)]
pub struct HelloWorldPlugin {
    initialized: bool,
}

impl HelloWorldPlugin {
    fn new() -> Self {
        Self::default()
    }
}

impl Plugin for HelloWorldPlugin {
    fn system_name(&self) -> &str {
        "Misc.HelloWorld"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn init(&mut self) -> anyhow::Result<()> {
        self.initialized = true;
        info!("[Hello World Plugin] Initialized!");
        Ok(())
    }

    fn cleanup(&mut self) {
        if self.initialized {
            self.initialized = false;
            info!("[Hello World Plugin] Cleaned up!");
        }
    }
}

kiln::declare_plugin!(HelloWorldPlugin, HelloWorldPlugin::new);
