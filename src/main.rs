use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use role_harness::container::ContainerBackend;
use role_harness::lifecycle::{GroupReport, GroupSpec, LifecycleController, TestCase, TestOutcome};
use role_harness::runtime::DockerRuntime;
use role_harness::{
    logging, EnvironmentHandle, HarnessConfig, Inventory, LocalRunner, NamingConvention,
    Provisioner, DEFAULT_IMAGE,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "rharness",
    version,
    about = "Boot, provision, and test containers for Ansible roles"
)]
struct Cli {
    /// JSON config file layered under environment variables
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Playbook applied to each container
    #[arg(long, global = true, value_name = "PATH")]
    playbook: Option<PathBuf>,

    /// Log commands, keys, and provisioning output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision one container and leave it running
    Up(UpArgs),
    /// Kill and remove a container and delete its inventory file
    Down(DownArgs),
    /// Run shell checks inside provisioned containers
    Check(CheckArgs),
    /// Print the inventory descriptor for a container
    Inventory(InventoryArgs),
}

#[derive(Parser, Debug)]
struct UpArgs {
    #[arg(long, default_value = DEFAULT_IMAGE)]
    image: String,

    /// Print the environment handle as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct DownArgs {
    #[arg(long)]
    container: String,
}

#[derive(Parser, Debug)]
struct CheckArgs {
    /// Image to test against; repeat for several (default: debian:jessie)
    #[arg(long = "image", value_name = "IMAGE")]
    images: Vec<String>,

    /// Give every check its own freshly provisioned container
    #[arg(long)]
    destructive: bool,

    /// Shell command run inside the container; passes on exit status 0
    #[arg(long = "check", value_name = "CMD", required = true)]
    checks: Vec<String>,

    /// Print the group report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser, Debug)]
struct InventoryArgs {
    #[arg(long)]
    container: String,

    #[arg(long)]
    port: u16,

    /// legacy (ansible_ssh_*) or modern (ansible_*)
    #[arg(long, default_value = "modern")]
    convention: NamingConvention,

    #[arg(long)]
    no_group_header: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = HarnessConfig::load(cli.config.as_deref())?;
    if let Some(playbook) = cli.playbook {
        config.playbook = playbook;
    }
    config.verbose |= cli.verbose;
    config.validate()?;

    match cli.command {
        Commands::Up(args) => cmd_up(&config, args),
        Commands::Down(args) => cmd_down(&config, args),
        Commands::Check(args) => cmd_check(&config, args),
        Commands::Inventory(args) => cmd_inventory(&config, args),
    }
}

fn cmd_up(config: &HarnessConfig, args: UpArgs) -> Result<()> {
    config.preflight()?;
    let provisioner = Provisioner::new(config, LocalRunner);
    let handle = provisioner.acquire(&args.image)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&handle)?);
    } else {
        println!("image: {}", handle.image);
        println!("container: {}", handle.container_id);
        println!("ssh_port: {}", handle.ssh_port);
        println!("inventory: {}", handle.inventory_path.display());
    }
    Ok(())
}

fn cmd_down(config: &HarnessConfig, args: DownArgs) -> Result<()> {
    // Validated before any runtime call so a bad id never reaches the
    // filesystem.
    let inventory_path = Inventory::path_in(&config.inventory_dir, &args.container)?;
    let provisioner = Provisioner::new(config, LocalRunner);
    let handle = EnvironmentHandle {
        image: String::new(),
        container_id: args.container,
        ssh_port: 0,
        inventory_path,
    };
    provisioner.release(&handle)?;
    println!("Released container {}", handle.container_id);
    Ok(())
}

fn cmd_check(config: &HarnessConfig, args: CheckArgs) -> Result<()> {
    config.preflight()?;
    let runner = LocalRunner;
    let provisioner = Provisioner::new(config, runner);
    let runtime = DockerRuntime::new(&runner, config.runtime.as_str());

    let tests: Vec<TestCase<'_>> = args
        .checks
        .iter()
        .map(|check| {
            let runtime = &runtime;
            let runner = &runner;
            TestCase::new(check.clone(), move |handle: &EnvironmentHandle| {
                let backend = ContainerBackend::new(runtime, runner, handle.container_id.as_str());
                let output = backend.run_shell(check)?;
                if !output.success() {
                    bail!(
                        "`{check}` {}\n{}",
                        output.failure_summary(),
                        output.stdout.trim_end()
                    );
                }
                Ok(())
            })
        })
        .collect();

    let mut spec = GroupSpec::with_images(args.images);
    spec.isolated = args.destructive;
    let report = LifecycleController::new(&provisioner).run_group(&spec, &tests);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if report.success() {
        Ok(())
    } else {
        let failed = report.count(|outcome| *outcome != TestOutcome::Passed);
        Err(anyhow!("{failed} of {} runs did not pass", report.runs.len()))
    }
}

fn print_report(report: &GroupReport) {
    for run in &report.runs {
        let (image, test) = (&run.image, &run.test);
        let container = run.container_id.as_deref().unwrap_or("-");
        match &run.outcome {
            TestOutcome::Passed => println!("PASS  [{image}] {test} ({container})"),
            TestOutcome::Failed(reason) => {
                println!("FAIL  [{image}] {test} ({container})\n      {reason}")
            }
            TestOutcome::SetupFailed(reason) => println!("SETUP [{image}] {test}\n      {reason}"),
        }
    }
    for failure in &report.teardown_failures {
        eprintln!("warning: {failure}");
    }
    let passed = report.count(|outcome| *outcome == TestOutcome::Passed);
    let failed = report.count(|outcome| matches!(outcome, TestOutcome::Failed(_)));
    let setup = report.count(|outcome| matches!(outcome, TestOutcome::SetupFailed(_)));
    let scope = &report.scope;
    println!("{passed} passed, {failed} failed, {setup} setup errors ({scope} scope)");
}

fn cmd_inventory(config: &HarnessConfig, args: InventoryArgs) -> Result<()> {
    let inventory = Inventory {
        container_id: args.container,
        port: args.port,
        convention: args.convention,
        group_header: config.inventory_group_header && !args.no_group_header,
    };
    print!("{}", inventory.render());
    Ok(())
}
