//! Delete command - remove a cluster, its registries and its saved state

use clap::Args;
use tracing::info;

use super::kind_utils;
use crate::config::CliConfig;
use crate::Result;

/// Delete a cluster and its registries
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Cluster name
    #[arg(long, default_value = "kind")]
    pub name: String,

    /// Leave registry containers running for reuse by a later create
    #[arg(long)]
    pub keep_registries: bool,

    /// Also remove registry data volumes (cached images)
    #[arg(long, conflicts_with = "keep_registries")]
    pub remove_volumes: bool,
}

pub async fn run(args: DeleteArgs, config: &CliConfig) -> Result<()> {
    let store = config.state_store();
    // Validates the name before anything is torn down
    store.cluster_dir(&args.name)?;

    if kind_utils::cluster_exists(config, &args.name).await? {
        kind_utils::delete_kind_cluster(config, &args.name).await?;
    } else {
        info!(cluster = %args.name, "No kind cluster to delete");
    }

    if !args.keep_registries {
        config
            .registry_manager()?
            .teardown_registries(&args.name, args.remove_volumes)
            .await?;
    }

    store.delete_cluster_state(&args.name)?;
    info!(cluster = %args.name, "Cluster deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: DeleteArgs,
    }

    #[test]
    fn keep_and_remove_volumes_conflict() {
        assert!(Wrapper::try_parse_from(["delete", "--keep-registries", "--remove-volumes"]).is_err());
        let parsed = Wrapper::try_parse_from(["delete", "--name", "dev", "--remove-volumes"]).unwrap();
        assert_eq!(parsed.args.name, "dev");
        assert!(parsed.args.remove_volumes);
    }
}
