#[macro_use]
extern crate clap;
extern crate edgemon;
#[macro_use]
extern crate log;
extern crate tokio_core;

use clap::{App, Arg};
use edgemon::{config, logger, manager};
use std::process;
use tokio_core::reactor::Core;

static OPS_CONFIG_ARG: &'static str = "opsCfg";
static CONFIG_ARG: &'static str = "config";

fn mk_app() -> App<'static, 'static> {
    App::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(Arg::with_name(OPS_CONFIG_ARG)
                 .long(OPS_CONFIG_ARG)
                 .value_name("PATH")
                 .required(true)
                 .takes_value(true)
                 .help("The ops service config file"))
        .arg(Arg::with_name(CONFIG_ARG)
                 .long(CONFIG_ARG)
                 .value_name("PATH")
                 .takes_value(true)
                 .help("The monitor config file"))
}

fn main() {
    let opts = mk_app().get_matches();

    let config = match config::load(opts.value_of(CONFIG_ARG)) {
        Ok(config) => config,
        Err(e) => {
            println!("Error starting service: failed to load config: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = logger::init(&config) {
        println!("Error starting service: failed to create log writers: {}", e);
        process::exit(1);
    }
    info!("starting with config {:?}", config);

    let mut core = match Core::new() {
        Ok(core) => core,
        Err(e) => {
            println!("Error starting service: failed to create reactor: {}", e);
            process::exit(1);
        }
    };

    let ops_config_path = match opts.value_of(OPS_CONFIG_ARG) {
        Some(path) => path,
        None => {
            println!("Error starting service: the --opsCfg argument is required");
            process::exit(1);
        }
    };

    let (running, _monitor) = match manager::start(ops_config_path, &config, &core.handle()) {
        Ok(started) => started,
        Err(e) => {
            println!("Error starting service: {}", e);
            process::exit(1);
        }
    };

    if core.run(running).is_err() {
        error!("monitor stopped on an error");
        process::exit(1);
    }
    info!("Closing.")
}
