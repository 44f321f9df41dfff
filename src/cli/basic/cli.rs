// Copyright 2025 Datapunk Contributors.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use crate::service::{cluster, cluster::recovery, db};

/// Returns Ok(false) when no subcommand was given and the node should serve.
pub async fn cli() -> Result<bool, anyhow::Error> {
    let app = clap::Command::new("datapunk")
        .version(clap::crate_version!())
        .about(clap::crate_description!())
        .subcommands(&[
            clap::Command::new("serve").about("start the node"),
            clap::Command::new("cluster")
                .about("cluster membership")
                .subcommands(&[
                    clap::Command::new("add-node")
                        .about("join a node by address")
                        .arg(clap::Arg::new("addr").required(true)),
                    clap::Command::new("remove-node")
                        .about("remove a node by id")
                        .arg(clap::Arg::new("id").required(true)),
                ]),
            clap::Command::new("partition")
                .about("partition management")
                .subcommand(
                    clap::Command::new("rebalance").about("assign unowned partitions"),
                ),
            clap::Command::new("backup")
                .about("partition backup and restore")
                .subcommands(&[
                    clap::Command::new("create")
                        .about("backup a partition to cold storage")
                        .arg(clap::Arg::new("partition").required(true)),
                    clap::Command::new("restore")
                        .about("restore a partition from its latest backup")
                        .arg(clap::Arg::new("partition").required(true))
                        .arg(
                            clap::Arg::new("version")
                                .short('v')
                                .long("version")
                                .help("restore this backup version instead of the latest"),
                        ),
                ]),
            clap::Command::new("metrics").about("dump prometheus metrics").subcommand(
                clap::Command::new("dump").about("print the current exposition"),
            ),
        ])
        .get_matches();

    let Some((name, command)) = app.subcommand() else {
        return Ok(false);
    };
    if name == "serve" {
        return Ok(false);
    }

    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    crate::service::partition::init()?;
    crate::service::federation::sources::init();
    cluster::init().await?;

    match name {
        "cluster" => match command.subcommand() {
            Some(("add-node", args)) => {
                let addr = args.get_one::<String>("addr").expect("required arg");
                let node = cluster::add_node(addr).await?;
                println!("added node {} at {}", node.uuid, node.http_addr);
            }
            Some(("remove-node", args)) => {
                let id = args.get_one::<String>("id").expect("required arg");
                cluster::remove_node(id).await?;
                println!("removed node {id}");
            }
            _ => return Err(anyhow::anyhow!("usage: cluster add-node|remove-node")),
        },
        "partition" => match command.subcommand() {
            Some(("rebalance", _)) => {
                let mut assigned = 0;
                let raft = cluster::raft::get()?;
                let state = raft.cluster_state();
                for partition in db::list_partitions() {
                    if !state.partition_locations.contains_key(&partition.key) {
                        cluster::replication::assign_partition(&partition.key).await?;
                        assigned += 1;
                    }
                }
                println!("rebalanced {assigned} partitions");
            }
            _ => return Err(anyhow::anyhow!("usage: partition rebalance")),
        },
        "backup" => match command.subcommand() {
            Some(("create", args)) => {
                let partition = args.get_one::<String>("partition").expect("required arg");
                let name = recovery::backup(partition).await?;
                println!("backup written: {name}");
            }
            Some(("restore", args)) => {
                let partition = args.get_one::<String>("partition").expect("required arg");
                let version = args
                    .get_one::<String>("version")
                    .map(|v| v.parse::<u64>())
                    .transpose()?;
                let restored = recovery::restore(partition, version).await?;
                println!("restored {restored} records into {partition}");
            }
            _ => return Err(anyhow::anyhow!("usage: backup create|restore <partition>")),
        },
        "metrics" => {
            print!("{}", config::metrics::gather());
        }
        _ => return Err(anyhow::anyhow!("unknown command: {name}")),
    }
    Ok(true)
}
