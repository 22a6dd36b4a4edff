use clap::Parser;
use cluster_secret::{config::Config, crds::ClusterSecret};
use kube::CustomResourceExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
enum Args {
    /// Run the controller
    Run(Config),
    /// Print the ClusterSecret CRD as YAML
    Crds,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    match args {
        Args::Crds => {
            println!("{}", serde_yaml::to_string(&ClusterSecret::crd())?);
        }
        Args::Run(config) => {
            cluster_secret::run(config).await?;
        }
    };

    Ok(())
}
