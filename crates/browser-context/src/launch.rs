//! Local Chrome/Chromium discovery and launch.

use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs};

use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use futures::io::{AsyncBufReadExt, BufReader};
use futures::stream::StreamExt;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use which::which;

use crate::error::ContextError;

/// Tunables for the persistent (locally launched) browser variant.
#[derive(Clone, Debug)]
pub struct LaunchConfig {
    pub executable: PathBuf,
    pub user_data_dir: PathBuf,
    pub headless: bool,
    pub launch_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            executable: detect_chrome_executable().unwrap_or_default(),
            user_data_dir: default_profile_dir(),
            headless: resolve_headless_default(),
            launch_retries: 5,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

fn resolve_headless_default() -> bool {
    // Chat UIs fight headless browsers, so headful is the default; set
    // PROMPTBRIDGE_HEADLESS=1 to opt in.
    match env::var("PROMPTBRIDGE_HEADLESS") {
        Ok(value) => {
            let lower = value.to_ascii_lowercase();
            matches!(lower.as_str(), "1" | "true" | "yes" | "on")
        }
        Err(_) => false,
    }
}

/// Per-OS cache location for the managed browser profile, created on first
/// launch. `PROMPTBRIDGE_PROFILE` overrides it.
pub fn default_profile_dir() -> PathBuf {
    if let Ok(path) = env::var("PROMPTBRIDGE_PROFILE") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    if let Some(dirs) = directories::ProjectDirs::from("", "", "promptbridge") {
        return dirs.cache_dir().join("browser-profile");
    }
    PathBuf::from("./.promptbridge-profile")
}

pub fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("PROMPTBRIDGE_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in chrome_executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    for candidate in os_specific_chrome_paths() {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    None
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(any(target_os = "macos", target_os = "linux", target_os = "freebsd"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        &["chrome"]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut paths = Vec::new();
        for key in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
            if let Ok(value) = env::var(key) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    let root = PathBuf::from(trimmed);
                    paths.push(root.join("Google/Chrome/Application/chrome.exe"));
                    paths.push(root.join("Chromium/Application/chrome.exe"));
                    paths.push(root.join("Microsoft/Edge/Application/msedge.exe"));
                }
            }
        }
        paths
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "freebsd"
    )))]
    {
        Vec::new()
    }
}

/// Launch the configured browser, retrying profile-lock failures, and return
/// the child process together with its DevTools WebSocket URL.
pub async fn launch_browser(config: &LaunchConfig) -> Result<(Child, String), ContextError> {
    if config.executable.as_os_str().is_empty() {
        return Err(ContextError::ChromeNotFound);
    }
    if !config.executable.exists() {
        return Err(ContextError::Launch(format!(
            "chrome executable not found at {}",
            config.executable.display()
        )));
    }

    fs::create_dir_all(&config.user_data_dir)
        .map_err(|err| ContextError::Launch(format!("failed to create user-data-dir: {err}")))?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_launch(config).await {
            Ok(result) => {
                info!(
                    target: "browser-context",
                    attempt,
                    profile = %config.user_data_dir.display(),
                    "browser launched"
                );
                return Ok(result);
            }
            Err(err) => {
                let message = err.to_string();
                if attempt < config.launch_retries && looks_profile_locked(&message) {
                    warn!(
                        target: "browser-context",
                        attempt,
                        %message,
                        "profile locked; retrying launch"
                    );
                    sleep(config.retry_backoff).await;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

fn looks_profile_locked(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("singletonlock")
        || lower.contains("processsingleton")
        || (lower.contains("profile") && lower.contains("in use"))
}

async fn try_launch(config: &LaunchConfig) -> Result<(Child, String), ContextError> {
    let browser_config = build_browser_config(config)?;
    let mut child = browser_config
        .launch()
        .map_err(|err| ContextError::Launch(format!("failed to launch chromium: {err}")))?;

    match extract_ws_url(&mut child).await {
        Ok(ws_url) => Ok((child, ws_url)),
        Err(err) => {
            let _ = child.kill().await;
            Err(err)
        }
    }
}

fn build_browser_config(config: &LaunchConfig) -> Result<BrowserConfig, ContextError> {
    let mut builder = BrowserConfig::builder()
        .request_timeout(Duration::from_secs(30))
        .launch_timeout(Duration::from_secs(20))
        .chrome_executable(config.executable.clone())
        .user_data_dir(config.user_data_dir.clone());

    if !config.headless {
        builder = builder.with_head();
    }

    if env::var("PROMPTBRIDGE_DISABLE_SANDBOX")
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
    {
        builder = builder.no_sandbox();
    }

    let mut args = vec![
        "--disable-background-networking",
        "--disable-background-timer-throttling",
        "--disable-breakpad",
        "--disable-client-side-phishing-detection",
        "--disable-component-update",
        "--disable-default-apps",
        "--disable-hang-monitor",
        "--disable-popup-blocking",
        "--disable-prompt-on-repost",
        "--disable-sync",
        "--metrics-recording-only",
        "--no-first-run",
        "--no-default-browser-check",
        "--password-store=basic",
        "--remote-allow-origins=*",
        "--use-mock-keychain",
    ];
    if config.headless {
        args.push("--headless=new");
        args.push("--hide-scrollbars");
        args.push("--mute-audio");
    }
    builder = builder.args(args);

    builder
        .build()
        .map_err(|err| ContextError::Launch(format!("browser config error: {err}")))
}

/// Scrape the DevTools WebSocket URL from Chromium's stderr.
async fn extract_ws_url(child: &mut Child) -> Result<String, ContextError> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ContextError::Launch("chromium process missing stderr handle".into()))?;
    let mut lines = BufReader::new(stderr).lines();
    let mut captured = Vec::new();

    let reader = async {
        while let Some(line) = lines.next().await {
            let line =
                line.map_err(|err| ContextError::Launch(format!("stderr read failed: {err}")))?;
            captured.push(line.clone());
            if let Some((_, ws)) = line.rsplit_once("listening on ") {
                let ws = ws.trim();
                if ws.starts_with("ws") && ws.contains("devtools/browser") {
                    return Ok(ws.to_string());
                }
            }
        }
        Err(ContextError::Launch(format!(
            "chromium exited before exposing devtools websocket url. stderr preview: {}",
            captured
                .iter()
                .take(8)
                .cloned()
                .collect::<Vec<_>>()
                .join(" | ")
        )))
    };

    timeout(Duration::from_secs(20), reader)
        .await
        .map_err(|_| {
            ContextError::Launch("timed out waiting for chromium devtools websocket url".into())
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn profile_lock_detection_matches_known_messages() {
        assert!(looks_profile_locked(
            "Failed to create a ProcessSingleton for your profile directory"
        ));
        assert!(looks_profile_locked("SingletonLock exists"));
        assert!(looks_profile_locked("The profile appears to be in use"));
        assert!(!looks_profile_locked("connection refused"));
    }

    #[test]
    fn env_override_wins_for_profile_dir() {
        let dir = tempdir().unwrap();
        let original = env::var("PROMPTBRIDGE_PROFILE").ok();
        env::set_var("PROMPTBRIDGE_PROFILE", dir.path());
        let resolved = default_profile_dir();
        match original {
            Some(value) => env::set_var("PROMPTBRIDGE_PROFILE", value),
            None => env::remove_var("PROMPTBRIDGE_PROFILE"),
        }
        assert_eq!(resolved, dir.path());
    }

    #[test]
    fn detects_chrome_from_env_var() {
        let dir = tempdir().unwrap();
        let exe_path = dir.path().join("my-chrome");
        fs::write(&exe_path, b"").unwrap();
        let original = env::var("PROMPTBRIDGE_CHROME").ok();
        env::set_var("PROMPTBRIDGE_CHROME", &exe_path);
        let detected = detect_chrome_executable();
        match original {
            Some(value) => env::set_var("PROMPTBRIDGE_CHROME", value),
            None => env::remove_var("PROMPTBRIDGE_CHROME"),
        }
        assert_eq!(detected, Some(exe_path));
    }
}
