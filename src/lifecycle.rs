//! Lifecycle Controller.
//!
//! A [`GroupSpec`] declares which images a group of tests runs against and
//! whether the tests may share an environment. [`LifecycleController`] runs
//! every test once per image, acquiring environments lazily through an
//! [`EnvironmentSource`] and releasing each one when its scope ends, whatever
//! the tests did.
//!
//! Per scope, [`ScopedEnvironment`] moves through
//! `Unresolved -> Active -> TornDown`. A failed acquisition parks it in
//! `Failed`, so later requests in the same scope get the original error back
//! instead of booting another container.

use crate::command::CommandRunner;
use crate::error::{HarnessError, HarnessResult, TeardownError};
use crate::provision::{EnvironmentHandle, Provisioner};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// Image used when a group declares none.
pub const DEFAULT_IMAGE: &str = "debian:jessie";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One environment per image, shared by every test in the group.
    Shared,
    /// A fresh environment for every test.
    Isolated,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::Isolated => f.write_str("isolated"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSpec {
    pub images: Vec<String>,
    /// Destructive tests mutate their environment and get one each.
    pub isolated: bool,
}

impl GroupSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_images<I, S>(images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            images: images.into_iter().map(Into::into).collect(),
            isolated: false,
        }
    }

    pub fn destructive(mut self) -> Self {
        self.isolated = true;
        self
    }

    /// Declared images, or [`DEFAULT_IMAGE`] when none are declared.
    pub fn resolved_images(&self) -> Vec<String> {
        if self.images.is_empty() {
            vec![DEFAULT_IMAGE.to_string()]
        } else {
            self.images.clone()
        }
    }

    pub fn scope(&self) -> Scope {
        if self.isolated {
            Scope::Isolated
        } else {
            Scope::Shared
        }
    }
}

/// Where environments come from. [`Provisioner`] is the real one.
pub trait EnvironmentSource {
    fn acquire(&self, image: &str) -> HarnessResult<EnvironmentHandle>;
    fn release(&self, handle: &EnvironmentHandle) -> Result<(), TeardownError>;
}

impl<R: CommandRunner> EnvironmentSource for Provisioner<'_, R> {
    fn acquire(&self, image: &str) -> HarnessResult<EnvironmentHandle> {
        Provisioner::acquire(self, image)
    }

    fn release(&self, handle: &EnvironmentHandle) -> Result<(), TeardownError> {
        Provisioner::release(self, handle)
    }
}

#[derive(Debug)]
enum ScopeState {
    Unresolved,
    Active(EnvironmentHandle),
    Failed(HarnessError),
    TornDown,
}

/// The environment bound to one scope for one image.
pub struct ScopedEnvironment<'s, S: EnvironmentSource + ?Sized> {
    source: &'s S,
    image: String,
    state: ScopeState,
}

impl<'s, S: EnvironmentSource + ?Sized> ScopedEnvironment<'s, S> {
    pub fn new(source: &'s S, image: impl Into<String>) -> Self {
        Self {
            source,
            image: image.into(),
            state: ScopeState::Unresolved,
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ScopeState::Active(_))
    }

    /// The bound environment, acquired on first request.
    pub fn get(&mut self) -> HarnessResult<&EnvironmentHandle> {
        if matches!(self.state, ScopeState::Unresolved) {
            match self.source.acquire(&self.image) {
                Ok(handle) => self.state = ScopeState::Active(handle),
                Err(err) => {
                    self.state = ScopeState::Failed(err.clone());
                    return Err(err);
                }
            }
        }
        match &self.state {
            ScopeState::Active(handle) => Ok(handle),
            ScopeState::Failed(err) => Err(err.clone()),
            ScopeState::Unresolved | ScopeState::TornDown => Err(HarnessError::ScopeClosed {
                image: self.image.clone(),
            }),
        }
    }

    /// Release the bound environment, if any. Safe to call more than once.
    pub fn teardown(&mut self) -> Result<(), TeardownError> {
        match std::mem::replace(&mut self.state, ScopeState::TornDown) {
            ScopeState::Active(handle) => self.source.release(&handle),
            _ => Ok(()),
        }
    }
}

impl<S: EnvironmentSource + ?Sized> Drop for ScopedEnvironment<'_, S> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            tracing::warn!("{err}");
        }
    }
}

pub type TestBody<'t> = Box<dyn Fn(&EnvironmentHandle) -> anyhow::Result<()> + 't>;

/// A named assertion run against a live environment.
pub struct TestCase<'t> {
    pub name: String,
    body: TestBody<'t>,
}

impl<'t> TestCase<'t> {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&EnvironmentHandle) -> anyhow::Result<()> + 't,
    {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }
}

impl fmt::Debug for TestCase<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed(String),
    /// The environment could not be built; the test body never ran.
    SetupFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRun {
    pub test: String,
    pub image: String,
    pub container_id: Option<String>,
    pub outcome: TestOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub scope: Scope,
    pub runs: Vec<TestRun>,
    pub teardown_failures: Vec<TeardownError>,
}

impl GroupReport {
    /// True when every run passed. Teardown failures are reported separately
    /// and do not change the result.
    pub fn success(&self) -> bool {
        self.runs
            .iter()
            .all(|run| run.outcome == TestOutcome::Passed)
    }

    pub fn count(&self, matches: impl Fn(&TestOutcome) -> bool) -> usize {
        self.runs.iter().filter(|run| matches(&run.outcome)).count()
    }
}

pub struct LifecycleController<'s, S: EnvironmentSource + ?Sized> {
    source: &'s S,
}

impl<'s, S: EnvironmentSource + ?Sized> LifecycleController<'s, S> {
    pub fn new(source: &'s S) -> Self {
        Self { source }
    }

    /// Run every test against every resolved image.
    ///
    /// Tests run sequentially. In shared scope, tests for one image see the
    /// same environment, released after the last of them. In isolated scope,
    /// each test gets its own environment, released right after it.
    pub fn run_group(&self, spec: &GroupSpec, tests: &[TestCase<'_>]) -> GroupReport {
        let scope = spec.scope();
        let mut report = GroupReport {
            scope,
            runs: Vec::with_capacity(tests.len() * spec.resolved_images().len()),
            teardown_failures: Vec::new(),
        };

        for image in spec.resolved_images() {
            tracing::info!(%image, %scope, tests = tests.len(), "running test group");
            match scope {
                Scope::Shared => {
                    let mut env = ScopedEnvironment::new(self.source, image.as_str());
                    for test in tests {
                        report.runs.push(run_test(&mut env, test));
                    }
                    if let Err(err) = env.teardown() {
                        tracing::warn!("{err}");
                        report.teardown_failures.push(err);
                    }
                }
                Scope::Isolated => {
                    let mut aborted: Option<String> = None;
                    for test in tests {
                        if let Some(reason) = &aborted {
                            report.runs.push(TestRun {
                                test: test.name.clone(),
                                image: image.clone(),
                                container_id: None,
                                outcome: TestOutcome::SetupFailed(format!(
                                    "group aborted after setup failure: {reason}"
                                )),
                            });
                            continue;
                        }
                        let mut env = ScopedEnvironment::new(self.source, image.as_str());
                        let run = run_test(&mut env, test);
                        if let TestOutcome::SetupFailed(reason) = &run.outcome {
                            aborted = Some(reason.clone());
                        }
                        report.runs.push(run);
                        if let Err(err) = env.teardown() {
                            tracing::warn!("{err}");
                            report.teardown_failures.push(err);
                        }
                    }
                }
            }
        }
        report
    }
}

fn run_test<S: EnvironmentSource + ?Sized>(
    env: &mut ScopedEnvironment<'_, S>,
    test: &TestCase<'_>,
) -> TestRun {
    let image = env.image().to_string();
    let handle = match env.get() {
        Ok(handle) => handle,
        Err(err) => {
            tracing::warn!(test = %test.name, %image, "setup failed: {err}");
            return TestRun {
                test: test.name.clone(),
                image,
                container_id: None,
                outcome: TestOutcome::SetupFailed(err.to_string()),
            };
        }
    };

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| (test.body)(handle))) {
        Ok(Ok(())) => TestOutcome::Passed,
        Ok(Err(err)) => TestOutcome::Failed(format!("{err:#}")),
        Err(payload) => TestOutcome::Failed(format!("panicked: {}", panic_message(&*payload))),
    };
    match &outcome {
        TestOutcome::Passed => {
            tracing::info!(test = %test.name, %image, container = %handle.container_id, "passed")
        }
        _ => tracing::warn!(test = %test.name, %image, container = %handle.container_id, "failed"),
    }
    TestRun {
        test: test.name.clone(),
        image,
        container_id: Some(handle.container_id.clone()),
        outcome,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;

    #[derive(Default)]
    struct CountingSource {
        attempts: RefCell<usize>,
        acquired: RefCell<Vec<String>>,
        released: RefCell<Vec<String>>,
        fail_images: Vec<String>,
    }

    impl EnvironmentSource for CountingSource {
        fn acquire(&self, image: &str) -> HarnessResult<EnvironmentHandle> {
            *self.attempts.borrow_mut() += 1;
            if self.fail_images.iter().any(|failing| failing == image) {
                return Err(HarnessError::Provision {
                    container_id: "c-failed".to_string(),
                    command: "ansible-playbook -i /tmp/c-failed site.yml".to_string(),
                    exit_code: Some(2),
                    stdout: String::new(),
                    stderr: "ERROR! the role 'web' was not found".to_string(),
                });
            }
            let mut acquired = self.acquired.borrow_mut();
            let id = format!("c{}", acquired.len());
            acquired.push(id.clone());
            Ok(EnvironmentHandle {
                image: image.to_string(),
                inventory_path: PathBuf::from("/tmp").join(&id),
                container_id: id,
                ssh_port: 32768,
            })
        }

        fn release(&self, handle: &EnvironmentHandle) -> Result<(), TeardownError> {
            self.released.borrow_mut().push(handle.container_id.clone());
            Ok(())
        }
    }

    #[test]
    fn empty_image_list_resolves_to_default() {
        assert_eq!(GroupSpec::new().resolved_images(), vec![DEFAULT_IMAGE]);
        assert_eq!(GroupSpec::new().scope(), Scope::Shared);
        assert_eq!(GroupSpec::new().destructive().scope(), Scope::Isolated);
        assert_eq!(
            GroupSpec::with_images(["a", "b"]).resolved_images(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn repeated_requests_return_the_bound_handle() {
        let source = CountingSource::default();
        let mut env = ScopedEnvironment::new(&source, "debian:jessie");
        assert!(!env.is_active());
        let first = env.get().unwrap().container_id.clone();
        let second = env.get().unwrap().container_id.clone();
        assert_eq!(first, second);
        assert!(env.is_active());
        assert_eq!(source.acquired.borrow().len(), 1);
    }

    #[test]
    fn teardown_is_idempotent_and_closes_scope() {
        let source = CountingSource::default();
        let mut env = ScopedEnvironment::new(&source, "debian:jessie");
        env.get().unwrap();
        env.teardown().unwrap();
        env.teardown().unwrap();
        assert_eq!(source.released.borrow().as_slice(), ["c0"]);
        assert!(matches!(env.get(), Err(HarnessError::ScopeClosed { .. })));
        drop(env);
        assert_eq!(source.released.borrow().len(), 1);
    }

    #[test]
    fn drop_releases_active_environment() {
        let source = CountingSource::default();
        {
            let mut env = ScopedEnvironment::new(&source, "debian:jessie");
            env.get().unwrap();
        }
        assert_eq!(source.released.borrow().as_slice(), ["c0"]);
    }

    #[test]
    fn unresolved_scope_releases_nothing() {
        let source = CountingSource::default();
        let mut env = ScopedEnvironment::new(&source, "debian:jessie");
        env.teardown().unwrap();
        assert!(source.released.borrow().is_empty());
    }

    #[test]
    fn failed_acquisition_is_not_retried_within_scope() {
        let source = CountingSource {
            fail_images: vec!["broken".to_string()],
            ..CountingSource::default()
        };
        let mut env = ScopedEnvironment::new(&source, "broken");
        let first = env.get().unwrap_err();
        let again = env.get().unwrap_err();

        assert_eq!(*source.attempts.borrow(), 1);
        assert!(matches!(again, HarnessError::Provision { .. }));
        assert_eq!(again.to_string(), first.to_string());
        assert!(again.is_setup_failure());
        env.teardown().unwrap();
        assert!(source.released.borrow().is_empty());
    }

    #[test]
    fn panicking_test_is_a_failure_and_still_torn_down() {
        let source = CountingSource::default();
        let tests = vec![
            TestCase::new("boom", |_| panic!("kaboom")),
            TestCase::new("ok", |_| Ok(())),
        ];
        let spec = GroupSpec::new().destructive();
        let report = LifecycleController::new(&source).run_group(&spec, &tests);
        assert_eq!(
            report.runs[0].outcome,
            TestOutcome::Failed("panicked: kaboom".to_string())
        );
        assert_eq!(report.runs[1].outcome, TestOutcome::Passed);
        assert_eq!(source.released.borrow().as_slice(), ["c0", "c1"]);
        assert!(!report.success());
    }

    #[test]
    fn isolated_setup_failure_aborts_remaining_tests_for_that_image() {
        let source = CountingSource {
            fail_images: vec!["broken".to_string()],
            ..CountingSource::default()
        };
        let tests = vec![
            TestCase::new("first", |_| Ok(())),
            TestCase::new("second", |_| Ok(())),
        ];
        let spec = GroupSpec::with_images(["broken", "good"]).destructive();
        let report = LifecycleController::new(&source).run_group(&spec, &tests);

        assert_eq!(report.runs.len(), 4);
        match &report.runs[0].outcome {
            TestOutcome::SetupFailed(reason) => assert!(reason.contains("role 'web'")),
            other => panic!("unexpected outcome {other:?}"),
        }
        match &report.runs[1].outcome {
            TestOutcome::SetupFailed(reason) => assert!(reason.contains("group aborted")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(report.runs[2].outcome, TestOutcome::Passed);
        assert_eq!(report.runs[3].outcome, TestOutcome::Passed);
        assert_eq!(source.acquired.borrow().len(), 2);
        assert_eq!(source.released.borrow().len(), 2);
    }
}
