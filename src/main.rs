use std::path::PathBuf;

use clap::Parser;
use family_tun::Tun;
use nix::unistd::{Group, User};

use siitd::args::Args;
use siitd::config::{Config, MTU_MIN};
use siitd::eventloop::EventLoop;
use siitd::logging::enable_logger;
use siitd::map::AddrMap;
use siitd::xlat::Translator;

fn main() {
    let args = Args::parse();

    if let Err(err) = enable_logger(args.log_sink(), args.debug) {
        eprintln!("Unable to set up logging: {err}");
        std::process::exit(1);
    }

    if let Err(err) = run(&args) {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(&args.config_file)?;

    // Tunnel management modes do their one thing and exit
    if args.mktun || args.rmtun {
        if args.user.is_some() || args.group.is_some() || args.chroot {
            return Err("--user, --group and --chroot do not apply to --mktun/--rmtun".into());
        }
        let tun = Tun::open(&config.tun_device)?;
        if args.mktun {
            tun.set_persistent(true)?;
            tun.set_owner(0, 0)?;
            log::info!("Created persistent tun device {}", tun.name());
        } else {
            tun.set_persistent(false)?;
            log::info!("Removed persistent tun device {}", tun.name());
        }
        return Ok(());
    }

    // Resolve names while /etc is still reachable
    let user = match &args.user {
        Some(name) => {
            Some(User::from_name(name)?.ok_or_else(|| format!("user {name} does not exist"))?)
        }
        None => None,
    };
    let group = match &args.group {
        Some(name) => {
            Some(Group::from_name(name)?.ok_or_else(|| format!("group {name} does not exist"))?)
        }
        None => None,
    };
    if args.chroot && config.data_dir.is_none() {
        return Err("cannot chroot without data-dir in the config".into());
    }
    if args.chroot && user.is_none() {
        return Err("chroot is ineffective without --user to drop privileges".into());
    }

    if let Some(dir) = &config.data_dir {
        std::fs::create_dir_all(dir)?;
    }

    let tun = Tun::open(&config.tun_device)?;
    let tun_mtu = tun.mtu()?;
    if tun_mtu < MTU_MIN {
        return Err(format!(
            "MTU {tun_mtu} of {} is too small, must be at least {MTU_MIN}",
            tun.name()
        )
        .into());
    }
    let egress_mtu = config.offlink_mtu.unwrap_or(tun_mtu).min(tun_mtu);
    log::info!("Using tun device {} with MTU {tun_mtu}", tun.name());

    if !args.foreground() {
        nix::unistd::daemon(false, false)?;
    }
    if let Some(pidfile) = &args.pidfile {
        std::fs::write(pidfile, format!("{}\n", std::process::id()))?;
    }

    // After this point the binding table lives at the chroot root
    let dynamic_map = config.data_dir.as_ref().map(|dir| {
        if args.chroot {
            PathBuf::from("/dynamic.map")
        } else {
            dir.join("dynamic.map")
        }
    });
    if args.chroot {
        // data_dir presence was checked above
        nix::unistd::chroot(config.data_dir.as_ref().unwrap().as_path())?;
        std::env::set_current_dir("/")?;
    }
    if let Some(group) = &group {
        nix::unistd::setgroups(&[group.gid])?;
        nix::unistd::setgid(group.gid)?;
    }
    if let Some(user) = &user {
        nix::unistd::setuid(user.uid)?;
    }

    let mut map = AddrMap::new(&config);
    if let Some(path) = &dynamic_map {
        match map.load_pool(path) {
            Ok(0) => {}
            Ok(count) => log::info!("Loaded {count} dynamic bindings from {}", path.display()),
            Err(err) => log::warn!("Unable to load {}: {err}", path.display()),
        }
    } else if config.dynamic_pool.is_some() {
        log::info!(
            "Note: dynamically-assigned mappings will not be saved across restarts. \
             Specify data-dir in the config to make them persistent"
        );
    }

    log::info!("Translator IPv4 address: {}", config.local4);
    log::info!("Translator IPv6 address: {}", config.local6);
    if let Some(prefix) = map.prefix() {
        log::info!("NAT64 prefix: {prefix}");
        if config.wkpf_strict && prefix == "64:ff9b::/96".parse().unwrap() {
            log::info!(
                "Note: traffic between IPv6 hosts and private IPv4 addresses \
                 will be dropped. Use a translation prefix within your \
                 organization's IPv6 address space instead of 64:ff9b::/96 if \
                 your IPv6 hosts need to reach private IPv4 addresses"
            );
        }
    }
    if let Some(pool) = map.pool() {
        log::info!(
            "Dynamic pool: {} ({} usable addresses)",
            pool.range(),
            pool.capacity()
        );
    }

    let translator = Translator::new(map, &config, egress_mtu);
    EventLoop::new(tun, translator, dynamic_map, tun_mtu)?.run()?;
    Ok(())
}
