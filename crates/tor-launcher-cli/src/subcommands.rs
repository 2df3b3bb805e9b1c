//! The `tor-launcher` subcommands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures::FutureExt as _;
use tor_ctlproto::{Ownership, ProtocolClient};
use tor_launcher::{
    ControlPortAccess, NetworkSettings, Preferences, ProcessEnvironment, ProcessSupervisor,
    SettingsBundle, settings,
};
use tor_rtcompat::{Runtime, SleepProvider as _};
use tracing::info;

use crate::cfg::CliConfig;
use crate::host::{self, FilePreferences, TerminalSurface};
use crate::process::ChildProcessHost;

/// Said when we can't talk to a Tor that somebody else started.
const AUTH_HINT: &str = "Couldn't talk to Tor. To use a Tor process that tor-launcher \
                         didn't start, set TOR_CONTROL_PASSWD or TOR_CONTROL_COOKIE_AUTH_FILE";

/// Work out how to reach and authenticate to the control port.
fn control_access(config: &CliConfig) -> Result<ControlPortAccess> {
    ControlPortAccess::resolve(
        &ProcessEnvironment::default(),
        config.launcher().control().address(),
        &mut rand::rng(),
    )
    .context("Can't work out how to reach the control port")
}

/// Return a client for a Tor process that is already running.
fn connect<R: Runtime>(runtime: R, config: &CliConfig) -> Result<ProtocolClient<R>> {
    let access = control_access(config)?;
    Ok(ProtocolClient::new(
        runtime,
        config.launcher().control().with_address(access.address()),
        access.control_auth(),
        Ownership::Disowned,
    ))
}

/// Return typed preferences over `store`, with defaults from `config`.
fn preferences(config: &CliConfig, store: &Arc<FilePreferences>) -> Preferences {
    Preferences::new(Arc::<FilePreferences>::clone(store), config.launcher().preferences().clone())
}

/// Wait for the user to press Ctrl-C.
#[cfg(feature = "tokio")]
async fn wait_for_ctrl_c() -> Result<()> {
    tokio_crate::signal::ctrl_c()
        .await
        .context("Unable to wait for Ctrl-C")
}

/// Wait for the user to press Ctrl-C.
#[cfg(not(feature = "tokio"))]
async fn wait_for_ctrl_c() -> Result<()> {
    futures::future::pending().await
}

/// Start and supervise Tor until it is interrupted, restarting the whole
/// launcher when asked to.
pub(crate) async fn run<R: Runtime>(
    runtime: R,
    config: &CliConfig,
    prefs: &Arc<FilePreferences>,
    settings_file: Option<PathBuf>,
) -> Result<()> {
    while run_once(runtime.clone(), config, prefs, settings_file.clone()).await? {
        info!("Restarting");
    }
    Ok(())
}

/// Start and supervise Tor once.
///
/// Returns true if we should start over.
async fn run_once<R: Runtime>(
    runtime: R,
    config: &CliConfig,
    prefs: &Arc<FilePreferences>,
    settings_file: Option<PathBuf>,
) -> Result<bool> {
    let launcher = config.launcher();
    let access = control_access(config)?;
    let (process, quit) = ChildProcessHost::new(launcher.clone(), access.clone());
    let surface = Arc::new(TerminalSurface::new(settings_file));
    let supervisor = ProcessSupervisor::new(
        runtime,
        launcher.clone(),
        &access,
        host::services(Arc::new(process), Arc::clone(prefs), Arc::clone(&surface)),
    );
    surface.attach(supervisor.clone());

    let policy = supervisor.policy();
    let work = async {
        supervisor.run().await?;
        if !policy.start_and_own_tor && !policy.only_configure_tor {
            info!("Nothing to do: TOR_SKIP_LAUNCH is set");
            return Ok(false);
        }
        Ok::<_, anyhow::Error>(quit.await.unwrap_or(false))
    };
    let outcome = futures::select! {
        r = work.fuse() => r,
        r = wait_for_ctrl_c().fuse() => {
            r?;
            info!("Interrupted; shutting down");
            supervisor.request_quit(false).await;
            Ok(false)
        }
    };
    surface.detach();
    outcome
}

/// Describe the bootstrap state of a running Tor.
pub(crate) async fn status<R: Runtime>(runtime: R, config: &CliConfig) -> Result<String> {
    let client = connect(runtime, config)?;
    let bootstrap = client.retrieve_bootstrap_status().await.context(AUTH_HINT)?;
    let network_disabled = client.get_conf_bool("DisableNetwork", false).await?;
    client.shutdown();

    let mut out = match bootstrap {
        Some(s) => {
            let mut line = format!("Bootstrapped {}% ({}): {}", s.progress(), s.tag(), s.summary());
            if let Some(w) = s.warning() {
                line += &format!("\nWarning: {}", w);
            }
            line
        }
        None => "Bootstrap status unknown".to_owned(),
    };
    out += &format!(
        "\nNetwork: {}",
        if network_disabled { "disabled" } else { "enabled" }
    );
    Ok(out)
}

/// Return the network settings of a running Tor, as JSON.
pub(crate) async fn show_settings<R: Runtime>(
    runtime: R,
    config: &CliConfig,
    prefs: &Arc<FilePreferences>,
) -> Result<String> {
    let client = connect(runtime, config)?;
    let prefs = preferences(config, prefs);
    let current = settings::read_settings(&client, &prefs)
        .await
        .context(AUTH_HINT)?;
    client.shutdown();
    Ok(current.to_form().to_json()?)
}

/// Read and check the network settings in the JSON file at `path`.
///
/// This blocks, so call it before entering the runtime.
pub(crate) fn load_settings_file(path: &Path) -> Result<NetworkSettings> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("Can't read {}", path.display()))?;
    let settings = SettingsBundle::from_json(&text)
        .with_context(|| format!("in {}", path.display()))?
        .validate()
        .with_context(|| format!("in {}", path.display()))?;
    Ok(settings)
}

/// Give `new_settings` to a running Tor.
pub(crate) async fn apply_settings<R: Runtime>(
    runtime: R,
    config: &CliConfig,
    prefs: &Arc<FilePreferences>,
    new_settings: &NetworkSettings,
) -> Result<String> {
    let client = connect(runtime, config)?;
    let prefs = preferences(config, prefs);
    settings::apply_settings(&client, &prefs, new_settings)
        .await
        .context("Tor didn't accept the settings")?;
    client.shutdown();
    Ok("Settings applied and saved".to_owned())
}

/// Collect Tor's log messages for `duration`, and return them.
pub(crate) async fn log<R: Runtime>(
    runtime: R,
    config: &CliConfig,
    duration: Duration,
) -> Result<String> {
    let client = connect(runtime.clone(), config)?;
    client.start_event_monitor().await.context(AUTH_HINT)?;
    info!(
        "Collecting Tor's log messages for {}",
        humantime::format_duration(duration)
    );
    runtime.sleep(duration).await;

    let mut out = client.export_log("\n");
    if client.log_has_warnings() {
        out += "(Tor logged warnings or errors.)\n";
    }
    client.shutdown();
    Ok(out)
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->

    use super::*;
    use tor_ctlproto::testing::{Action, FakeTor, mock_net, standard_reply};
    use tor_rtmock::MockRuntime;

    #[test]
    fn status_of_running_tor() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, standard_reply).await;
            let out = status(net, &CliConfig::default()).await.unwrap();
            assert_eq!(out, "Bootstrapped 100% (done): Done\nNetwork: enabled");
            assert_eq!(tor.count("TAKEOWNERSHIP"), 0);
        });
    }

    #[test]
    fn status_auth_failure() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let _tor = FakeTor::spawn(&server, |conn, line: &str| {
                if line.starts_with("AUTHENTICATE") {
                    Action::Reply("515 Authentication failed\r\n".into())
                } else {
                    standard_reply(conn, line)
                }
            })
            .await;
            let err = status(net, &CliConfig::default()).await.unwrap_err();
            assert!(err.to_string().contains("TOR_CONTROL_PASSWD"));
        });
    }

    #[test]
    fn settings_round_trip() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, standard_reply).await;
            let config = CliConfig::default();
            let prefs = Arc::new(FilePreferences::load(None).unwrap());

            let shown = show_settings(net.clone(), &config, &prefs).await.unwrap();
            let bundle = SettingsBundle::from_json(&shown).unwrap();
            assert!(bundle.proxy_settings.use_proxy);
            assert_eq!(bundle.proxy_settings.address, "127.0.0.1");

            let path = std::env::temp_dir().join(format!(
                "tor-launcher-cli-settings-{}.json",
                std::process::id()
            ));
            std::fs::write(&path, r#"{"firewallSettings": {"useFirewallPorts": true, "allowedPorts": "80,443"}}"#)
                .unwrap();
            let new_settings = load_settings_file(&path).unwrap();
            let out = apply_settings(net, &config, &prefs, &new_settings)
                .await
                .unwrap();
            assert_eq!(out, "Settings applied and saved");
            assert_eq!(tor.count("SETCONF ReachableAddresses"), 1);
            assert_eq!(tor.count("SAVECONF"), 1);
            std::fs::remove_file(&path).unwrap();
        });
    }

    #[test]
    fn invalid_settings_file() {
        let path = std::env::temp_dir().join(format!(
            "tor-launcher-cli-bad-settings-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, r#"{"proxySettings": {"useProxy": true}}"#).unwrap();
        let err = load_settings_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains(&path.display().to_string()));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_settings_file(&path).is_err());
        std::fs::remove_file(&path).unwrap();

        let err = load_settings_file(&path).unwrap_err();
        assert!(err.to_string().starts_with("Can't read"));
    }

    #[test]
    fn collect_log() {
        MockRuntime::test_with_various(|rt| async move {
            let (net, server) = mock_net(rt.clone());
            let tor = FakeTor::spawn(&server, standard_reply).await;
            let task = rt.spawn_join("log", async move {
                log(net, &CliConfig::default(), Duration::from_secs(5)).await
            });
            rt.progress_until_stalled().await;
            assert_eq!(tor.count("SETEVENTS"), 1);

            tor.push(0, "650 NOTICE Bootstrapped 5%\r\n650 WARN Clock skew detected\r\n");
            rt.progress_until_stalled().await;
            rt.advance_by(Duration::from_secs(5)).await;

            let out = task.await.unwrap();
            assert!(out.contains("Bootstrapped 5%"));
            assert!(out.contains("Clock skew detected"));
            assert!(out.ends_with("(Tor logged warnings or errors.)\n"));
        });
    }
}
