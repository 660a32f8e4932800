//! # Runner Module
//!
//! Drives the game's batch shadow computation:
//!
//! 1.  Validates the request (working directory, executable, target folder).
//! 2.  Kills any stale game process and launches a fresh one with the
//!     shadow-computation flags.
//! 3.  Watches the process table until no game process is left.
//!
//! The game may exit and re-spawn itself under a new pid to carry on with the
//! next batch, so the first exit is never taken as completion. The game offers
//! no completion callback, so everything here is polling on a timer.

use std::fmt;
use std::path::{MAIN_SEPARATOR_STR, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Result, ShadowError};
use crate::locator::TARGET_EXECUTABLE;
use crate::system::SystemOps;

/// The game resolves `/computeallshadows` relative to a folder with this name.
pub const MAPS_FOLDER_NAME: &str = "Maps";

/// Lightmap quality passed as `/LmQuality=<level>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Quality {
    #[value(alias = "VeryFast", alias = "Very Fast")]
    VeryFast,
    Fast,
    Default,
    #[default]
    High,
    Ultra2,
}

impl Quality {
    /// Spelling the game expects on its command line.
    pub fn as_cli_value(self) -> &'static str {
        match self {
            Quality::VeryFast => "VeryFast",
            Quality::Fast => "Fast",
            Quality::Default => "Default",
            Quality::High => "High",
            Quality::Ultra2 => "Ultra2",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_cli_value())
    }
}

/// A validated shadow job, ready to be handed to [`Runner::launch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowJobRequest {
    pub executable: PathBuf,
    /// Map folder relative to the `Maps` root.
    pub subfolder: String,
    pub quality: Quality,
}

impl ShadowJobRequest {
    /// The four flags of the game's batch shadow mode.
    pub fn arguments(&self) -> Vec<String> {
        vec![
            format!("/computeallshadows={}", self.subfolder),
            "/fullcheck".to_string(),
            "/useronly".to_string(),
            format!("/LmQuality={}", self.quality),
        ]
    }
}

/// Turns a user-entered folder into the path the game expects, relative to `Maps`.
///
/// Surrounding quotes are dropped and both `/` and `\` count as separators.
/// Everything up to and including the last segment equal to "maps" (any case)
/// is removed. Input without such a segment is returned untouched.
pub fn normalize_subfolder(input: &str) -> String {
    let unquoted = input.trim_matches(|c| c == '"' || c == '\'');
    let segments: Vec<&str> = unquoted
        .split(['/', '\\'])
        .filter(|s| !s.is_empty())
        .collect();

    match segments
        .iter()
        .rposition(|s| s.eq_ignore_ascii_case(MAPS_FOLDER_NAME))
    {
        Some(idx) => segments[idx + 1..].join(MAIN_SEPARATOR_STR),
        None => input.to_string(),
    }
}

/// Fails unless `cwd` is literally named `Maps`.
pub fn ensure_maps_folder(cwd: &Path) -> Result<()> {
    match cwd.file_name() {
        Some(name) if name == MAPS_FOLDER_NAME => Ok(()),
        Some(name) => Err(ShadowError::WrongWorkingDirectory {
            found: name.to_string_lossy().into_owned(),
        }),
        None => Err(ShadowError::WrongWorkingDirectory {
            found: cwd.display().to_string(),
        }),
    }
}

/// Validates user input into a [`ShadowJobRequest`].
///
/// Checks run in a fixed order and the first failure wins: working directory,
/// then executable existence, then a non-empty target folder. Nothing is
/// killed or spawned here.
pub fn prepare_request(
    system: &impl SystemOps,
    cwd: &Path,
    executable: &Path,
    raw_folder: &str,
    quality: Quality,
) -> Result<ShadowJobRequest> {
    ensure_maps_folder(cwd)?;

    if !system.path_exists(executable) {
        return Err(ShadowError::MissingExecutable(executable.to_path_buf()));
    }

    let trimmed = raw_folder.trim();
    if trimmed.is_empty() {
        return Err(ShadowError::MissingTargetFolder);
    }
    let subfolder = normalize_subfolder(trimmed);
    if subfolder.trim().is_empty() {
        return Err(ShadowError::MissingTargetFolder);
    }

    Ok(ShadowJobRequest {
        executable: executable.to_path_buf(),
        subfolder,
        quality,
    })
}

/// Timing and process-name configuration for [`Runner`].
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub process_name: String,
    /// Upper bound on waiting for killed processes to leave the table.
    pub kill_timeout: Duration,
    pub kill_poll: Duration,
    /// Pause after an exit before looking for a re-spawned process.
    pub debounce: Duration,
    pub poll_interval: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            process_name: TARGET_EXECUTABLE.to_string(),
            kill_timeout: Duration::from_secs(5),
            kill_poll: Duration::from_millis(100),
            debounce: Duration::from_millis(500),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Result of clearing stale game processes before a launch.
///
/// A timeout is not an error: the launch goes ahead either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    NoneRunning,
    /// Every killed process left the table.
    ConfirmedDead { pids: Vec<u32> },
    /// These pids were still listed when the wait ran out; assumed dead.
    TimedOutAssumedDead { pids: Vec<u32> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// No game process is left. `watched` lists every pid followed, in order.
    Finished { watched: Vec<u32> },
    /// The watch was abandoned through the [`CancelToken`].
    Cancelled { watching: u32 },
}

/// Cooperative cancellation for the watch loop.
///
/// The CLI never fires it; it exists so a caller can abandon a watch that
/// would otherwise run for as long as the game does.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`; returns `true` if cancelled before or during the wait.
    async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_cancelled(),
            _ = notified => true,
        }
    }
}

/// States of the watch loop after the game has been launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Watching(u32),
    Debounce(u32),
    Recheck(u32),
    Done,
}

pub struct Runner<'a, S: SystemOps> {
    system: &'a S,
    settings: RunnerSettings,
}

impl<'a, S: SystemOps> Runner<'a, S> {
    pub fn new(system: &'a S, settings: RunnerSettings) -> Self {
        Self { system, settings }
    }

    /// The strict "refuse-if-running" guard. Callers may invoke it before [`Runner::launch`].
    pub fn ensure_not_running(&self) -> Result<()> {
        debug!("Runner state: ConflictCheck");
        let pids = self.system.list_processes_by_name(&self.settings.process_name);
        if pids.is_empty() {
            return Ok(());
        }
        Err(ShadowError::ProcessConflict {
            name: self.settings.process_name.clone(),
            pids,
        })
    }

    /// Force-kills every running game process and waits, bounded, for them to disappear.
    pub async fn kill_stale(&self) -> KillOutcome {
        let name = &self.settings.process_name;
        let pids = self.system.list_processes_by_name(name);
        if pids.is_empty() {
            return KillOutcome::NoneRunning;
        }

        for &pid in &pids {
            info!("Killing stale {} (pid {})", name, pid);
            if !self.system.kill_process(pid) {
                warn!("Kill signal for pid {} was not delivered", pid);
            }
        }

        let deadline = Instant::now() + self.settings.kill_timeout;
        loop {
            let remaining: Vec<u32> = self
                .system
                .list_processes_by_name(name)
                .into_iter()
                .filter(|pid| pids.contains(pid))
                .collect();

            if remaining.is_empty() {
                return KillOutcome::ConfirmedDead { pids };
            }
            if Instant::now() >= deadline {
                warn!(
                    "{} still listed after {:?} (pids {:?}); continuing anyway",
                    name, self.settings.kill_timeout, remaining
                );
                return KillOutcome::TimedOutAssumedDead { pids: remaining };
            }
            tokio::time::sleep(self.settings.kill_poll).await;
        }
    }

    /// Kills stale instances, then spawns the game. Returns the new pid.
    ///
    /// A spawn failure is returned immediately; there is no retry.
    pub async fn start(&self, request: &ShadowJobRequest) -> Result<u32> {
        debug!("Runner state: Killing");
        let killed = self.kill_stale().await;
        debug!("Kill outcome: {:?}", killed);

        debug!("Runner state: Launching");
        let args = request.arguments();
        info!("Launching {:?} {}", request.executable, args.join(" "));

        let pid = self
            .system
            .spawn_detached(&request.executable, &args)
            .map_err(|source| ShadowError::SpawnFailure {
                path: request.executable.clone(),
                source,
            })?;

        info!("Started {} (pid {})", self.settings.process_name, pid);
        Ok(pid)
    }

    /// Blocks until neither `pid` nor any process it re-spawned is running.
    ///
    /// After each exit the loop waits out the debounce, then follows the first
    /// other same-named process still in the table, if any.
    pub async fn watch(&self, pid: u32, cancel: &CancelToken) -> RunOutcome {
        let name = &self.settings.process_name;
        let mut watched = vec![pid];
        let mut state = WatchState::Watching(pid);

        loop {
            debug!("Runner state: {:?}", state);
            state = match state {
                WatchState::Watching(current) => {
                    while self.system.list_processes_by_name(name).contains(&current) {
                        if cancel.sleep(self.settings.poll_interval).await {
                            warn!("Watch on pid {} cancelled", current);
                            return RunOutcome::Cancelled { watching: current };
                        }
                    }
                    WatchState::Debounce(current)
                }
                WatchState::Debounce(exited) => {
                    if cancel.sleep(self.settings.debounce).await {
                        return RunOutcome::Cancelled { watching: exited };
                    }
                    WatchState::Recheck(exited)
                }
                WatchState::Recheck(exited) => {
                    let next = self
                        .system
                        .list_processes_by_name(name)
                        .into_iter()
                        .find(|&other| other != exited);
                    match next {
                        Some(respawned) => {
                            info!("{} re-spawned as pid {}; still waiting", name, respawned);
                            watched.push(respawned);
                            WatchState::Watching(respawned)
                        }
                        None => WatchState::Done,
                    }
                }
                WatchState::Done => {
                    info!("No {} process left", name);
                    return RunOutcome::Finished { watched };
                }
            };
        }
    }

    /// Kill-then-launch, then watch until the whole process tree is gone.
    ///
    /// `on_started` runs once the game has been spawned and before the watch
    /// begins. It is never called when the spawn fails.
    pub async fn launch(
        &self,
        request: &ShadowJobRequest,
        cancel: &CancelToken,
        on_started: impl FnOnce(u32),
    ) -> Result<RunOutcome> {
        let pid = self.start(request).await?;
        on_started(pid);
        Ok(self.watch(pid, cancel).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::MockSystem;
    use proptest::prelude::*;

    fn fast_settings() -> RunnerSettings {
        RunnerSettings {
            kill_timeout: Duration::from_millis(30),
            kill_poll: Duration::from_millis(1),
            debounce: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn request() -> ShadowJobRequest {
        ShadowJobRequest {
            executable: PathBuf::from("/games/Trackmania.exe"),
            subfolder: "Winter".to_string(),
            quality: Quality::Ultra2,
        }
    }

    fn sep_join(parts: &[&str]) -> String {
        parts.join(MAIN_SEPARATOR_STR)
    }

    #[test]
    fn normalize_strips_quotes_and_everything_up_to_maps() {
        assert_eq!(
            normalize_subfolder(r#""C:\Users\x\Maps\Winter\Track1""#),
            sep_join(&["Winter", "Track1"])
        );
        assert_eq!(
            normalize_subfolder("'/home/x/Documents/Trackmania/maps/Spring/'"),
            "Spring"
        );
        assert_eq!(normalize_subfolder(r"C:\MAPS\Maps\A"), "A");
        assert_eq!(normalize_subfolder(r"C:\Users\x\Maps"), "");
    }

    #[test]
    fn normalize_without_maps_is_identity() {
        assert_eq!(normalize_subfolder("Foo/Bar"), "Foo/Bar");
        assert_eq!(normalize_subfolder("\"Winter\""), "\"Winter\"");
        assert_eq!(normalize_subfolder("Mapsy/Winter"), "Mapsy/Winter");
    }

    #[test]
    fn arguments_follow_the_game_flag_contract() {
        assert_eq!(
            request().arguments(),
            vec![
                "/computeallshadows=Winter",
                "/fullcheck",
                "/useronly",
                "/LmQuality=Ultra2",
            ]
        );
    }

    #[test]
    fn quality_uses_game_spelling() {
        assert_eq!(Quality::default(), Quality::High);
        assert_eq!(Quality::VeryFast.to_string(), "VeryFast");
        use clap::ValueEnum;
        assert_eq!(Quality::from_str("very-fast", true), Ok(Quality::VeryFast));
        assert_eq!(Quality::from_str("Very Fast", true), Ok(Quality::VeryFast));
        assert_eq!(Quality::from_str("ultra2", true), Ok(Quality::Ultra2));
    }

    #[test]
    fn wrong_working_directory_is_rejected_before_touching_the_executable() {
        let system = MockSystem::new().with_existing("/games/Trackmania.exe");
        let err = prepare_request(
            &system,
            Path::new("/home/x/Documents"),
            Path::new("/games/Trackmania.exe"),
            "Winter",
            Quality::High,
        )
        .unwrap_err();

        assert!(matches!(err, ShadowError::WrongWorkingDirectory { ref found } if found == "Documents"));
        assert!(system.path_checks.lock().unwrap().is_empty());
        assert_eq!(system.spawn_count(), 0);
    }

    #[test]
    fn maps_name_is_matched_literally() {
        assert!(ensure_maps_folder(Path::new("/home/x/Maps")).is_ok());
        assert!(ensure_maps_folder(Path::new("/home/x/maps")).is_err());
    }

    #[test]
    fn missing_executable_is_reported() {
        let system = MockSystem::new();
        let err = prepare_request(
            &system,
            Path::new("/home/x/Maps"),
            Path::new("/nowhere/Trackmania.exe"),
            "Winter",
            Quality::High,
        )
        .unwrap_err();
        assert!(matches!(err, ShadowError::MissingExecutable(_)));
    }

    #[test]
    fn empty_target_folder_is_rejected() {
        let system = MockSystem::new().with_existing("/games/Trackmania.exe");
        for raw in ["", "   ", r"C:\Users\x\Maps\"] {
            let err = prepare_request(
                &system,
                Path::new("/home/x/Maps"),
                Path::new("/games/Trackmania.exe"),
                raw,
                Quality::High,
            )
            .unwrap_err();
            assert!(matches!(err, ShadowError::MissingTargetFolder), "{:?}", raw);
        }
        assert!(system.killed.lock().unwrap().is_empty());
        assert_eq!(system.spawn_count(), 0);
    }

    #[test]
    fn valid_input_becomes_a_normalized_request() {
        let system = MockSystem::new().with_existing("/games/Trackmania.exe");
        let req = prepare_request(
            &system,
            Path::new("/home/x/Maps"),
            Path::new("/games/Trackmania.exe"),
            "  \"/home/x/Maps/Winter\"  ",
            Quality::Fast,
        )
        .unwrap();
        assert_eq!(req.subfolder, "Winter");
        assert_eq!(req.quality, Quality::Fast);
    }

    #[test]
    fn strict_guard_reports_running_instances() {
        let system = MockSystem::with_process_script(vec![vec![7, 8]]);
        let runner = Runner::new(&system, fast_settings());
        match runner.ensure_not_running() {
            Err(ShadowError::ProcessConflict { pids, .. }) => assert_eq!(pids, vec![7, 8]),
            other => panic!("expected conflict, got {:?}", other),
        }

        let idle = MockSystem::with_process_script(vec![vec![]]);
        assert!(Runner::new(&idle, fast_settings()).ensure_not_running().is_ok());
    }

    #[tokio::test]
    async fn kill_waits_until_the_table_is_clear() {
        let system = MockSystem::with_process_script(vec![vec![5, 6], vec![6], vec![]]);
        let runner = Runner::new(&system, fast_settings());

        let outcome = runner.kill_stale().await;

        assert_eq!(outcome, KillOutcome::ConfirmedDead { pids: vec![5, 6] });
        assert_eq!(*system.killed.lock().unwrap(), vec![5, 6]);
    }

    #[tokio::test]
    async fn kill_timeout_is_reported_but_not_fatal() {
        let system = MockSystem::with_process_script(vec![vec![5]]);
        let runner = Runner::new(&system, fast_settings());

        assert_eq!(
            runner.kill_stale().await,
            KillOutcome::TimedOutAssumedDead { pids: vec![5] }
        );
    }

    #[tokio::test]
    async fn launch_follows_a_respawned_process_until_none_is_left() {
        let mut system = MockSystem::with_process_script(vec![
            vec![],   // kill check
            vec![10], // original still alive
            vec![],   // original exited
            vec![20], // recheck: respawned
            vec![20],
            vec![],
            vec![], // recheck: nothing left
        ]);
        system.spawn_pid = 10;
        let runner = Runner::new(&system, fast_settings());

        let outcome = runner.launch(&request(), &CancelToken::new(), |_| {}).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished { watched: vec![10, 20] });
        let spawned = system.spawned.lock().unwrap();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].0, PathBuf::from("/games/Trackmania.exe"));
        assert_eq!(spawned[0].1[0], "/computeallshadows=Winter");
    }

    #[tokio::test]
    async fn started_hook_runs_after_spawn_and_before_the_watch() {
        let mut system = MockSystem::with_process_script(vec![vec![], vec![10], vec![], vec![]]);
        system.spawn_pid = 10;
        let runner = Runner::new(&system, fast_settings());

        let mut seen = None;
        let outcome = runner
            .launch(&request(), &CancelToken::new(), |pid| {
                // Only the kill check has touched the process table so far.
                seen = Some((pid, system.spawn_count(), *system.list_calls.lock().unwrap()));
            })
            .await
            .unwrap();

        assert_eq!(seen, Some((10, 1, 1)));
        assert_eq!(outcome, RunOutcome::Finished { watched: vec![10] });
    }

    #[tokio::test]
    async fn started_hook_is_skipped_when_the_spawn_fails() {
        let mut system = MockSystem::with_process_script(vec![vec![]]);
        system.spawn_error = Some(std::io::ErrorKind::PermissionDenied);
        let runner = Runner::new(&system, fast_settings());

        let mut called = false;
        let result = runner
            .launch(&request(), &CancelToken::new(), |_| called = true)
            .await;

        assert!(matches!(result, Err(ShadowError::SpawnFailure { .. })));
        assert!(!called);
    }

    #[tokio::test]
    async fn stale_instances_are_killed_before_spawning() {
        let mut system = MockSystem::with_process_script(vec![vec![3], vec![], vec![]]);
        system.spawn_pid = 11;
        let runner = Runner::new(&system, fast_settings());

        let outcome = runner.launch(&request(), &CancelToken::new(), |_| {}).await.unwrap();

        assert_eq!(*system.killed.lock().unwrap(), vec![3]);
        assert_eq!(outcome, RunOutcome::Finished { watched: vec![11] });
    }

    #[tokio::test]
    async fn recheck_follows_the_first_other_process() {
        let mut system = MockSystem::with_process_script(vec![
            vec![],
            vec![],
            vec![10, 30, 40],
            vec![],
        ]);
        system.spawn_pid = 10;
        let runner = Runner::new(&system, fast_settings());

        let outcome = runner.launch(&request(), &CancelToken::new(), |_| {}).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished { watched: vec![10, 30] });
    }

    #[tokio::test]
    async fn spawn_failure_is_surfaced_without_watching() {
        let mut system = MockSystem::with_process_script(vec![vec![]]);
        system.spawn_error = Some(std::io::ErrorKind::NotFound);
        let runner = Runner::new(&system, fast_settings());

        let err = runner.launch(&request(), &CancelToken::new(), |_| {}).await.unwrap_err();

        assert!(matches!(err, ShadowError::SpawnFailure { .. }));
        assert_eq!(*system.list_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn cancellation_abandons_a_stuck_watch() {
        let mut system = MockSystem::with_process_script(vec![vec![], vec![10]]);
        system.spawn_pid = 10;
        let mut settings = fast_settings();
        settings.poll_interval = Duration::from_secs(3600);
        let runner = Runner::new(&system, settings);

        let token = CancelToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = runner.launch(&request(), &token, |_| {}).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled { watching: 10 });
    }

    fn segment() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_]{1,8}".prop_filter("not a maps segment", |s| !s.eq_ignore_ascii_case("maps"))
    }

    proptest! {
        #[test]
        fn normalize_keeps_only_segments_after_maps(
            prefix in prop::collection::vec("[A-Za-z0-9_]{1,8}", 0..4),
            maps in "[mM][aA][pP][sS]",
            suffix in prop::collection::vec(segment(), 0..4),
            backslash in any::<bool>(),
            quoted in any::<bool>(),
        ) {
            let sep = if backslash { "\\" } else { "/" };
            let mut parts = prefix.clone();
            parts.push(maps);
            parts.extend(suffix.iter().cloned());
            let mut input = parts.join(sep);
            if quoted {
                input = format!("\"{}\"", input);
            }

            prop_assert_eq!(normalize_subfolder(&input), suffix.join(MAIN_SEPARATOR_STR));
        }

        #[test]
        fn normalize_is_identity_without_maps(parts in prop::collection::vec(segment(), 1..5)) {
            let input = parts.join("/");
            prop_assert_eq!(normalize_subfolder(&input), input.clone());
        }
    }
}
