use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use solo_deploy::agent::HttpAgentClient;
use solo_deploy::blobstore::{Blobstore, DavBlobUploader, LocalBlobstore};
use solo_deploy::cloud::Cloud;
use solo_deploy::compile::{
    DependencyAnalyzer, IndexCompiledPackageRepo, ReleaseCompiler, ReleasePackagesCompiler,
    ScriptPackageCompiler,
};
use solo_deploy::config::{DeployerConfig, DeploymentStateService, FileDeploymentStateService};
use solo_deploy::deployment::Deployer;
use solo_deploy::eventlog::{failure_message, ConsoleEventLogger, EventLogger, Stage};
use solo_deploy::index::{FileIndex, Index};
use solo_deploy::install::{CpiInstaller, JobInstaller, PackageInstaller};
use solo_deploy::manifest::DeploymentManifest;
use solo_deploy::release::{ReleaseReader, ReleaseValidator};
use solo_deploy::stemcell::StemcellReader;
use solo_deploy::templates::{HandlebarsJobRenderer, IndexTemplatesRepo, TemplatesCompiler};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "solo-deploy")]
#[command(about = "Deploy a single VM through a Cloud Provider Interface")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct SoloDeployCli {
    /// Directory holding caches, blobs and deployment state
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Converge the deployment described by a manifest
    Deploy {
        /// Deployment manifest (YAML)
        manifest: PathBuf,
        /// Release tarball providing the `cpi` job
        cpi_release: PathBuf,
        /// Stemcell tarball
        stemcell: PathBuf,
        /// Release tarball with the jobs to deploy
        release: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = SoloDeployCli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting solo-deploy v{}", env!("CARGO_PKG_VERSION"));

    let config = cli
        .workspace
        .map(DeployerConfig::new)
        .unwrap_or_default();

    let result = match cli.command {
        Command::Deploy {
            manifest,
            cpi_release,
            stemcell,
            release,
        } => run_deploy(&config, manifest, cpi_release, stemcell, release).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Deployment failed: {:#}", e);
            eprintln!("Deployment failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Shared caches backing every release compilation of one run.
struct CompileContext {
    config: DeployerConfig,
    blobstore: Arc<dyn Blobstore>,
    packages_index: Arc<dyn Index>,
    templates_index: Arc<dyn Index>,
    event_logger: Arc<dyn EventLogger>,
}

impl CompileContext {
    fn release_compiler(&self) -> ReleaseCompiler {
        let package_compiler = ScriptPackageCompiler::new(
            self.config.compile_packages_dir(),
            self.blobstore.clone(),
            PackageInstaller::new(self.blobstore.clone()),
        );
        let packages = ReleasePackagesCompiler::new(
            DependencyAnalyzer::new(),
            Arc::new(package_compiler),
            Arc::new(IndexCompiledPackageRepo::new(self.packages_index.clone())),
            self.event_logger.clone(),
        );
        let templates = TemplatesCompiler::new(
            Arc::new(HandlebarsJobRenderer::new()),
            self.blobstore.clone(),
            Arc::new(IndexTemplatesRepo::new(self.templates_index.clone())),
            self.event_logger.clone(),
        );
        ReleaseCompiler::new(packages, templates)
    }
}

async fn run_deploy(
    config: &DeployerConfig,
    manifest_path: PathBuf,
    cpi_release_path: PathBuf,
    stemcell_path: PathBuf,
    release_path: PathBuf,
) -> Result<()> {
    config
        .ensure_dirs()
        .with_context(|| format!("Preparing workspace {:?}", config.workspace))?;

    let manifest = DeploymentManifest::load(&manifest_path)?;
    manifest.validate()?;

    let event_logger: Arc<dyn EventLogger> = Arc::new(ConsoleEventLogger::default());
    let state: Arc<dyn DeploymentStateService> =
        Arc::new(FileDeploymentStateService::new(config.state_file()));
    let director_id = state.load()?.director_id;
    let blobstore: Arc<dyn Blobstore> = Arc::new(LocalBlobstore::new(config.blobstore_dir()));

    let context = CompileContext {
        config: config.clone(),
        blobstore: blobstore.clone(),
        packages_index: Arc::new(FileIndex::new(config.compiled_packages_index())),
        templates_index: Arc::new(FileIndex::new(config.templates_index())),
        event_logger: event_logger.clone(),
    };

    let cpi_installer = CpiInstaller::new(
        ReleaseReader::new(),
        ReleaseValidator::new(),
        context.release_compiler(),
        JobInstaller::new(
            blobstore.clone(),
            PackageInstaller::new(blobstore.clone()),
            config.jobs_dir(),
            config.packages_dir(),
            event_logger.clone(),
        ),
        config.packages_dir(),
        event_logger.clone(),
    );
    let installation = cpi_installer
        .install(
            &cpi_release_path,
            &manifest.name,
            &manifest.cloud_provider.properties,
        )
        .await
        .context("Installing CPI")?;
    info!("CPI installed at {:?}", installation.executable());
    let cloud: Arc<dyn Cloud> = Arc::new(installation.cloud(&director_id));

    let release = ReleaseReader::new().read(&release_path).await?;
    let validator = ReleaseValidator::new();
    let stage = Stage::new(event_logger.clone(), "validating");
    stage.start();
    if let Err(e) = stage
        .perform("Validating release", async { validator.validate(&release) })
        .await
    {
        stage.fail(failure_message(&e));
        return Err(e.into());
    }
    stage.finish();

    let compiled = context
        .release_compiler()
        .compile(&release, &manifest.name, &manifest.properties)
        .await
        .with_context(|| format!("Compiling release '{}'", release.name))?;

    let stemcell = StemcellReader::new().read(&stemcell_path).await?;

    let mbus = manifest.cloud_provider.mbus.trim_end_matches('/');
    let agent = HttpAgentClient::new(mbus, &director_id)?;
    let uploader = DavBlobUploader::new(format!("{mbus}/blobs"));

    Deployer::new(
        cloud,
        Arc::new(agent),
        blobstore,
        Arc::new(uploader),
        state,
        event_logger,
    )
    .deploy(&manifest, &compiled, &stemcell)
    .await?;

    info!("Deployment '{}' is up to date", manifest.name);
    Ok(())
}
