//! Application-under-test process management

use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

use webprobe_common::{AppConfig, HarnessError, HarnessResult};

/// Handle to a running application process
pub struct AppServer {
    child: Child,
    health_url: String,
}

impl AppServer {
    /// Spawn the configured command and wait until its health URL answers
    pub async fn spawn(config: &AppConfig) -> HarnessResult<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| HarnessError::InvalidConfig("app.command must not be empty".into()))?;

        info!("Starting application: {}", config.command.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args).stdout(Stdio::null()).stderr(Stdio::inherit());
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| HarnessError::ServerStartup(format!("Failed to spawn {}: {}", program, e)))?;

        let mut server = AppServer {
            child,
            health_url: config.health_url.clone(),
        };

        if let Err(e) = server
            .wait_for_healthy(Duration::from_millis(config.startup_timeout_ms))
            .await
        {
            let _ = server.stop();
            return Err(e);
        }

        info!("Application is healthy at {}", server.health_url);
        Ok(server)
    }

    async fn wait_for_healthy(&mut self, timeout: Duration) -> HarnessResult<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout {
            attempts += 1;

            if let Some(status) = self.child.try_wait()? {
                return Err(HarnessError::ServerStartup(format!(
                    "process exited during startup with {}",
                    status
                )));
            }

            match client.get(&self.health_url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => warn!("Health check returned {}", resp.status()),
                Err(e) => {
                    if attempts == 1 {
                        info!("Waiting for application to start...");
                    }
                    // Refused connections are expected until the app listens
                    if !e.is_connect() {
                        warn!("Health check error: {}", e);
                    }
                }
            }

            sleep(Duration::from_millis(100)).await;
        }

        Err(HarnessError::ServerHealthCheck(attempts))
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Stop the process: SIGTERM first, then kill
    pub fn stop(&mut self) -> HarnessResult<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        info!("Stopping application (pid: {})", self.child.id());

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(self.child.id() as i32);
            if kill(pid, Signal::SIGTERM).is_ok() {
                let deadline = Instant::now() + Duration::from_millis(500);
                while Instant::now() < deadline {
                    if self.child.try_wait()?.is_some() {
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
        Ok(())
    }
}

impl Drop for AppServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
