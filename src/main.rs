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

use datapunk::{cli, handler, job, service};

const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_CONFIG: i32 = 64;
const EXIT_INTERRUPT: i32 = 130;

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime built");
    let code = runtime.block_on(run());
    std::process::exit(code);
}

async fn run() -> i32 {
    // cli commands handle everything themselves and exit
    match cli::basic::cli::cli().await {
        Ok(true) => return EXIT_OK,
        Ok(false) => {}
        Err(e) => {
            eprintln!("error: {e}");
            let message = e.to_string();
            return if message.starts_with("usage:") || message.starts_with("unknown command") {
                EXIT_USAGE
            } else {
                EXIT_ERROR
            };
        }
    }

    let cfg = config::get_config();
    env_logger::init_from_env(
        env_logger::Env::new().default_filter_or(cfg.log.level.as_str()),
    );

    if let Err(e) = config::init() {
        eprintln!("config init error: {e}");
        return EXIT_CONFIG;
    }
    if let Err(e) = infra::init().await {
        eprintln!("infra init error: {e}");
        return EXIT_CONFIG;
    }
    if let Err(e) = service::partition::init() {
        eprintln!("partition init error: {e}");
        return EXIT_CONFIG;
    }
    service::query::parser::init();
    service::federation::sources::init();
    service::auth::init();
    service::monitor::init();
    if let Err(e) = service::cluster::init().await {
        eprintln!("cluster init error: {e}");
        return EXIT_ERROR;
    }
    if let Err(e) = job::init().await {
        eprintln!("job init error: {e}");
        return EXIT_ERROR;
    }

    log::info!("starting datapunk node {}", *config::cluster::LOCAL_NODE_UUID);
    tokio::select! {
        result = handler::http::router::serve() => {
            if let Err(e) = result {
                log::error!("http server error: {e}");
                return EXIT_ERROR;
            }
            EXIT_OK
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down on interrupt");
            EXIT_INTERRUPT
        }
    }
}
