// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

pub(crate) use clap::Parser;

#[derive(Parser)]
#[command(name = "vxlan-agent")]
#[command(about = "VXLAN overlay network agent", long_about = None)]
pub(crate) struct CmdArgs {
    #[arg(
        long = "etcdEndpoint",
        value_name = "URL",
        default_value = "http://127.0.0.1:2379",
        help = "etcd endpoint"
    )]
    pub etcd_endpoint: String,
}
