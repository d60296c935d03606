// WebDriver capabilities and the optional managed driver process
use crate::config::Browser;
use crate::model::FetchError;
use serde_json::{Map, Value, json};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use url::Url;

/// Capabilities for a new session of the chosen browser.
pub fn capabilities(browser: Browser, headless: bool, binary: Option<&str>) -> Map<String, Value> {
    let (browser_name, options_key) = match browser {
        Browser::Chrome | Browser::Chromium => ("chrome", "goog:chromeOptions"),
        Browser::Edge => ("MicrosoftEdge", "ms:edgeOptions"),
    };

    let mut args = vec!["--disable-gpu", "--window-size=1920,1080"];
    if headless {
        args.push("--headless=new");
    } else {
        args.push("--start-maximized");
    }

    let mut options = Map::new();
    options.insert("args".into(), json!(args));
    if let Some(binary) = binary {
        options.insert("binary".into(), json!(binary));
    }

    let mut caps = Map::new();
    caps.insert("browserName".into(), json!(browser_name));
    caps.insert(options_key.into(), Value::Object(options));
    caps
}

fn driver_port(webdriver_url: &str) -> Result<u16, FetchError> {
    Url::parse(webdriver_url)
        .ok()
        .and_then(|u| u.port_or_known_default())
        .ok_or_else(|| FetchError::Session(format!("no port in webdriver_url {}", webdriver_url)))
}

/// A chromedriver / msedgedriver process started by us and killed with the session.
pub struct DriverProcess {
    child: Child,
}

impl DriverProcess {
    pub async fn spawn(binary: &Path, webdriver_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let port = driver_port(webdriver_url)?;
        info!("Starting driver {} on port {}", binary.display(), port);
        let child = Command::new(binary)
            .arg(format!("--port={}", port))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FetchError::Session(format!("cannot start {}: {}", binary.display(), e)))?;

        let process = Self { child };
        if let Err(e) = wait_until_ready(webdriver_url, timeout).await {
            process.shutdown().await;
            return Err(e);
        }
        Ok(process)
    }

    pub async fn shutdown(mut self) {
        match self.child.kill().await {
            Ok(()) => info!("Driver process stopped"),
            Err(e) => warn!("Failed to stop driver process: {}", e),
        }
    }
}

/// Only an explicit `{"value": {"ready": true}}` counts; anything else on the
/// port is not a usable driver.
fn reports_ready(status: &Value) -> bool {
    status["value"]["ready"].as_bool() == Some(true)
}

/// Polls the driver's `/status` endpoint until it reports ready.
async fn wait_until_ready(webdriver_url: &str, timeout: Duration) -> Result<(), FetchError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .map_err(|e| FetchError::Session(e.to_string()))?;
    let status_url = format!("{}/status", webdriver_url.trim_end_matches('/'));
    let deadline = Instant::now() + timeout;

    loop {
        match client.get(&status_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(body) if reports_ready(&body) => {
                    debug!("Driver ready at {}", webdriver_url);
                    return Ok(());
                }
                Ok(body) => debug!("Driver not ready yet: {}", body),
                Err(e) => warn!("Unexpected /status reply from {}: {}", webdriver_url, e),
            },
            Ok(resp) => debug!("Driver status {}", resp.status()),
            Err(e) => debug!("Driver not reachable yet: {}", e),
        }
        if Instant::now() >= deadline {
            return Err(FetchError::Session(format!(
                "driver at {} not ready after {:?}",
                webdriver_url, timeout
            )));
        }
        sleep(Duration::from_millis(250)).await;
    }
}
