//! Devices are initialized by `os_init` in stage order, then by priority
//! within a stage. Registration closes when the scheduler starts.
use std::sync::Mutex;
use tern_kernel::{
    dev::{self, DevFlags, DevHandlers, DevId, DevInitStage, DevOpError, DevStatus},
    os, DevCreateError, KernelCfg,
};

use crate::KernelTestUtil;

tern_port_std::use_port!(unsafe struct SystemTraits);
impl KernelCfg for SystemTraits {
    fn bsp_init() {
        LOG.lock().unwrap().push("bsp");
    }
}

static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn init(dev: DevId, _: usize) -> Result<(), DevStatus> {
    LOG.lock()
        .unwrap()
        .push(dev::dev_name::<SystemTraits>(dev).unwrap());
    Ok(())
}

fn open(_: DevId, arg: usize) -> Result<(), DevStatus> {
    if arg == 0 {
        Ok(())
    } else {
        Err(DevStatus(arg as i32))
    }
}

fn register_devices() {
    let create = |name, stage, prio| {
        dev::dev_create::<SystemTraits>(name, stage, prio, init, 0).unwrap();
    };
    create("sensor", DevInitStage::Secondary, 0);
    create("spi", DevInitStage::Primary, 5);
    create("gpio", DevInitStage::Primary, 1);
    create("rtc", DevInitStage::Kernel, 0);
}

fn main_body(_: usize) {
    assert_eq!(
        *LOG.lock().unwrap(),
        ["rtc", "bsp", "gpio", "spi", "sensor"]
    );

    assert_eq!(
        dev::dev_create::<SystemTraits>("late", DevInitStage::Primary, 0, init, 0),
        Err(DevCreateError::BadContext)
    );

    let spi = dev::dev_lookup::<SystemTraits>("spi").unwrap().unwrap();
    assert!(dev::dev_flags::<SystemTraits>(spi)
        .unwrap()
        .contains(DevFlags::INITIALIZED | DevFlags::READY));

    dev::dev_set_handlers::<SystemTraits>(
        spi,
        DevHandlers {
            open: Some(open),
            ..DevHandlers::default()
        },
    )
    .unwrap();
    assert_eq!(dev::dev_open::<SystemTraits>("spi", 0), Ok(spi));
    assert_eq!(dev::dev_open_count::<SystemTraits>(spi), Ok(1));
    assert_eq!(
        dev::dev_open::<SystemTraits>("spi", 7),
        Err(DevOpError::Driver(DevStatus(7)))
    );
    assert_eq!(dev::dev_open_count::<SystemTraits>(spi), Ok(1));
    dev::dev_close::<SystemTraits>(spi).unwrap();
    assert_eq!(dev::dev_open_count::<SystemTraits>(spi), Ok(0));

    assert_eq!(
        dev::dev_open::<SystemTraits>("nonexistent", 0),
        Err(DevOpError::NotFound)
    );

    let mut walked = Vec::new();
    dev::dev_walk::<SystemTraits>(|_, name, _| {
        walked.push(name);
        true
    })
    .unwrap();
    assert_eq!(walked, ["rtc", "gpio", "spi", "sensor"]);

    TEST_UTIL.success::<SystemTraits>();
}

#[test]
fn run() {
    TEST_UTIL.run_boot::<SystemTraits>(|| {
        register_devices();
        os::os_init::<SystemTraits>(Some(main_body));
        os::os_start::<SystemTraits>();
    });
}
