use std::env;
use std::process;
use std::sync::Arc;

use dsp_kit::control::api::{self, armed_label};
use dsp_kit::dsp::Backend;
use dsp_kit::{
    DevicePaths, DeviceManager, Direction, DriverConfig, LoopbackBackend, LoopbackSpec,
    OssBackend,
};

fn loopback_manager() -> DeviceManager {
    let backend = LoopbackBackend::new();
    backend.add_device(
        "/dev/dsp",
        LoopbackSpec {
            mixer: Some("/dev/mixer".to_string()),
            ..LoopbackSpec::default()
        },
    );
    let config = DriverConfig::with_devices(vec![DevicePaths::new("/dev/dsp", "/dev/mixer")]);
    DeviceManager::init(config, Arc::new(backend) as Arc<dyn Backend>)
}

fn oss_manager() -> DeviceManager {
    DeviceManager::init(DriverConfig::from_env(), Arc::new(OssBackend::new()))
}

fn print_status(manager: &DeviceManager) {
    let status = api::get_status(manager);
    if status.devices.is_empty() {
        eprintln!("dspctl: no usable dsp devices on backend '{}'", status.backend);
        process::exit(1);
    }
    println!("Backend : {}", status.backend);
    println!("Devices:");
    for (device, volume) in status.devices.iter().zip(&status.volumes) {
        let format = device
            .format
            .map(|f| f.to_string())
            .unwrap_or_else(|| "-".to_string());
        let volume = match volume {
            Some((left, right)) => format!("{left}/{right}%"),
            None => "n/a".to_string(),
        };
        println!(
            "  [{}] {} | open={} | out={} | in={} | format={} | fragments={}x{} | volume={} | caps={:?}",
            device.index,
            device.path,
            device.open_count,
            armed_label(device, Direction::Output),
            armed_label(device, Direction::Input),
            format,
            device.geometry.fragments,
            device.geometry.fragment_size,
            volume,
            device.capabilities,
        );
    }
}

fn main() {
    let mut status_only = false;
    let mut loopback = false;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--status" | "-s" => status_only = true,
            "--loopback" | "-l" => loopback = true,
            "--help" | "-h" => {
                println!(
                    "Usage: dspctl [--status] [--loopback]\n\n\
                     Without --status the interactive console launches.\n\
                     --loopback uses a software card instead of /dev/dsp*."
                );
                return;
            }
            other => {
                eprintln!("dspctl: unknown argument '{other}'");
                process::exit(1);
            }
        }
    }

    let manager = Arc::new(if loopback {
        loopback_manager()
    } else {
        oss_manager()
    });

    if status_only {
        print_status(&manager);
        return;
    }

    if let Err(err) = dsp_kit::control::ui::run(manager) {
        eprintln!("dspctl: {err}");
        process::exit(1);
    }
}
