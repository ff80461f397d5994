//! Runs over a shared memory image that is unmapped between boots, the way
//! a device loses its volatile state while FRAM keeps the image.

mod common;

use chain::nvm::{BootKind, Fram, FramError, FramPath, Retained, Scratch};
use chain::power::{Outage, Probe};
use chain::{Device, LogicalTime};

use common::{A, Nv, Snapshot, entering, log, program};

fn image_path(test: &str) -> FramPath {
    FramPath::new(format!("/chain-it-{test}-{}", std::process::id())).unwrap()
}

fn boot_or_skip(path: &FramPath, test: &str) -> Option<(Fram<Nv, Retained>, BootKind)> {
    match Fram::<Nv, Retained>::boot(path) {
        Ok(booted) => Some(booted),
        Err(err @ FramError::Os { errno, .. }) if errno == rustix::io::Errno::ACCESS => {
            eprintln!("Skipping {test}: {err}");
            None
        }
        Err(err) => panic!("{test}: {err}"),
    }
}

fn clean_run(until: u64) -> Snapshot {
    let image = Nv::default();
    let device = Device::new(program(&log()), &image);
    device.power_on(&mut Outage::when(entering(until))).unwrap();
    Snapshot::of(&image)
}

#[test]
fn warm_boot_resumes_the_active_activation() {
    let path = image_path("resume");
    Fram::<Nv, Scratch>::erase(&path).unwrap();

    {
        let Some((fram, kind)) = boot_or_skip(&path, "warm_boot_resumes_the_active_activation")
        else {
            return;
        };
        assert_eq!(kind, BootKind::Cold);
        let device = Device::new(program(&log()), &*fram);
        device.power_on(&mut Outage::when(entering(6))).unwrap();
        assert_eq!(fram.chain.active().time, LogicalTime::new(6));
    }

    {
        let (fram, kind) = Fram::<Nv, Retained>::boot(&path).unwrap();
        assert_eq!(kind, BootKind::Warm);
        let device = Device::new(program(&log()), &*fram);
        let report = device.power_on(&mut Outage::when(entering(9))).unwrap();

        assert_eq!(report.resumed.task, A);
        assert_eq!(report.resumed.time, LogicalTime::new(6));
        assert_eq!(report.boot, Some(2));
        assert_eq!(Snapshot::of(&fram), clean_run(9));
    }

    Fram::<Nv, Scratch>::erase(&path).unwrap();
}

#[test]
fn self_write_lost_with_the_mapping_is_discarded() {
    let path = image_path("lost-write");
    Fram::<Nv, Scratch>::erase(&path).unwrap();

    {
        let Some((fram, _)) = boot_or_skip(&path, "self_write_lost_with_the_mapping_is_discarded")
        else {
            return;
        };
        let device = Device::new(program(&log()), &*fram);
        let mut lose = Outage::when(|p: &Probe| {
            p.label == Some("a: counted") && p.time == LogicalTime::new(3)
        });
        device.power_on(&mut lose).unwrap();
        assert!(fram.count.n.swap_state().pending);
    }

    {
        let (fram, kind) = Fram::<Nv, Scratch>::boot(&path).unwrap();
        assert_eq!(kind, BootKind::Warm);
        let log = log();
        let device = Device::new(program(&log), &*fram);
        device.power_on(&mut Outage::when(entering(8))).unwrap();

        // The retry of a@3 saw the committed count, not the lost write.
        let first = log.borrow()[0];
        assert_eq!((first.task, first.time, first.value), (A, LogicalTime::new(3), 1));
        assert_eq!(Snapshot::of(&fram), clean_run(8));
    } // Scratch: unlinked on drop
}
