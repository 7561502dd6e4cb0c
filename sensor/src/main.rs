#[cfg(feature = "esp32")]
mod esp;
#[cfg(not(feature = "esp32"))]
mod host;

/// Host builds simulate the logger; `--features esp32` builds the firmware.
#[cfg(not(feature = "esp32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run_simulation().await
}

#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run_firmware()
}
