//! End-to-end adapter tests against the simulated board

use crate::adapter::{AbortOutcome, Adapter, Submission};
use crate::config::{AdapterConfig, BoardFlags};
use crate::ioctl::IoctlCommand;
use crate::mailbox::{cmd, subop};
use crate::passthru::{PassThru, PASSTHRU_SIZE, SG64_SIZE};
use crate::quiesce::QuiesceState;
use crate::registry::AdapterRegistry;
use crate::request::{DataBuffer, HostByte, RequestId, ScsiRequest, ScsiResult, DRIVER_SENSE};
use crate::sim::SimHal;
use crate::MegaError;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use helix_hal::interrupts::IrqReturn;
use spin::Mutex;
use std::time::Duration;

// =============================================================================
// HELPERS
// =============================================================================

#[derive(Debug, Clone)]
struct Done {
    id: RequestId,
    result: ScsiResult,
    sense: [u8; 16],
    data: DataBuffer,
}

type Log = Arc<Mutex<Vec<Done>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn request(log: &Log, channel: u8, target: u8, cdb: &[u8], data: DataBuffer) -> ScsiRequest {
    let log = log.clone();
    ScsiRequest::new(channel, target, 0, cdb, data, move |req| {
        log.lock().push(Done {
            id: req.id(),
            result: req.result(),
            sense: *req.sense(),
            data: req.data.clone(),
        });
    })
    .unwrap()
}

fn read10(lba: u32, blocks: u16) -> [u8; 10] {
    let lba = lba.to_be_bytes();
    let blocks = blocks.to_be_bytes();
    [0x28, 0, lba[0], lba[1], lba[2], lba[3], 0, blocks[0], blocks[1], 0]
}

/// READ(10) of one block from a logical drive on virtual channel 0
fn read_drive(log: &Log, target: u8) -> ScsiRequest {
    request(log, 0, target, &read10(0, 1), DataBuffer::Single(vec![0; 512]))
}

fn attach_with(quartz: bool, config: AdapterConfig) -> (Adapter<SimHal>, SimHal) {
    let hal = SimHal::new(quartz);
    let sim = hal.clone();
    let adapter = Adapter::attach(hal, config).unwrap();
    (adapter, sim)
}

fn quartz() -> (Adapter<SimHal>, SimHal) {
    attach_with(true, AdapterConfig::new().with_board(BoardFlags::QUARTZ))
}

fn last_issued(sim: &SimHal) -> crate::sim::Fetched {
    *sim.issued().last().unwrap()
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..5000 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("condition never held");
}

/// Physical host channel 0 when logical channels come first
const PHYS_CHANNEL: u8 = crate::NVIRT_CHAN;

// =============================================================================
// ATTACH
// =============================================================================

#[test]
fn test_attach_probes_firmware() {
    let (adapter, sim) = quartz();
    assert!(adapter.board().contains(BoardFlags::QUARTZ | BoardFlags::LD40));
    assert!(adapter.supports_ext_cdb());
    assert!(adapter.supports_random_delete());
    assert!(sim.irq_enabled());

    let opcodes: Vec<u8> = sim.fetched().iter().map(|f| f.decoded.cmd).collect();
    assert!(opcodes.contains(&cmd::FC_NEW_CONFIG));
    assert!(opcodes.contains(&cmd::MISC));
    assert!(opcodes.contains(&cmd::CHNL_CLASS));
    assert!(opcodes.contains(&cmd::BIOS_PVT_DATA));
    assert!(sim.fetched().iter().all(|f| f.privileged && f.decoded.cmdid == 0xFE));
    assert_eq!(adapter.free_slots(), crate::MAX_COMMANDS as usize);
}

#[test]
fn test_attach_falls_back_to_8ld_inquiry() {
    let hal = SimHal::new(true);
    hal.set_status(cmd::FC_NEW_CONFIG, subop::ENQUIRY3, 0x01);
    hal.set_status(cmd::MISC, subop::SUP_DEL_LOGDRV, 0x01);
    let sim = hal.clone();
    let adapter = Adapter::attach(hal, AdapterConfig::new().with_board(BoardFlags::QUARTZ)).unwrap();

    assert!(!adapter.board().contains(BoardFlags::LD40));
    assert!(!adapter.supports_random_delete());
    assert!(sim.fetched().iter().any(|f| f.decoded.cmd == cmd::ADAPTERINQ));

    // 8LD firmware stops at drive 7; target 9 skips the initiator id
    let log = log();
    let outcome = adapter.submit(read_drive(&log, 9)).unwrap();
    assert_eq!(outcome, Submission::Completed);
    assert_eq!(log.lock()[0].result.host(), Some(HostByte::BadTarget));
}

#[test]
fn test_attach_reads_boot_drive_from_bios() {
    let mut bios = [0u8; 16];
    bios[0] = 0x01;
    bios[1] = 3;
    let sum = bios[..14].iter().fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
    bios[14..].copy_from_slice(&0u16.wrapping_sub(sum).to_le_bytes());

    let hal = SimHal::new(true);
    hal.set_bios(bios);
    let sim = hal.clone();
    let adapter = Adapter::attach(hal, AdapterConfig::new().with_board(BoardFlags::QUARTZ)).unwrap();

    // The boot drive is presented first and the drives before it move up
    let log = log();
    let mut drives = Vec::new();
    for target in 0..5 {
        adapter.submit(read_drive(&log, target)).unwrap();
        drives.push(last_issued(&sim).decoded.logdrv);
    }
    assert_eq!(drives, vec![3, 0, 1, 2, 4]);
}

#[test]
fn test_attach_rejects_invalid_config() {
    let hal = SimHal::new(true);
    let err = Adapter::attach(hal, AdapterConfig::new().with_max_cmds(0)).unwrap_err();
    assert_eq!(err, MegaError::InvalidParameter);
}

// =============================================================================
// BLOCK I/O
// =============================================================================

#[test]
fn test_read10_mailbox_encoding() {
    let (adapter, sim) = quartz();
    let log = log();
    let req = request(
        &log,
        0,
        2,
        &read10(0x0102_0304, 512),
        DataBuffer::Single(vec![0; 512 * 512]),
    );

    assert_eq!(adapter.submit(req).unwrap(), Submission::Issued);
    let fetched = last_issued(&sim).decoded;
    assert_eq!(fetched.cmd, cmd::LREAD);
    assert_eq!(fetched.lba, 0x0102_0304);
    assert_eq!(fetched.numsectors, 512);
    assert_eq!(fetched.logdrv, 2);
    assert_eq!(fetched.numsgelements, 0);
    assert_ne!(fetched.xferaddr, 0);
    assert_eq!(fetched.cmdid, 1);
    assert_eq!(sim.memory().live_mappings(), 1);
}

#[test]
fn test_completion_runs_exactly_once() {
    let (adapter, sim) = quartz();
    let log = log();
    let req = read_drive(&log, 2);
    let id = req.id();
    adapter.submit(req).unwrap();
    assert!(log.lock().is_empty());

    sim.complete(&sim.outstanding(), 0);
    assert_eq!(adapter.handle_interrupt(), IrqReturn::Handled);
    assert_eq!(log.lock().len(), 1);
    assert_eq!(log.lock()[0].id, id);
    assert!(log.lock()[0].result.is_good());
    assert_eq!(sim.memory().live_mappings(), 0);

    // A stale id for the freed slot is ignored
    sim.complete(&[1], 0);
    assert_eq!(adapter.handle_interrupt(), IrqReturn::Handled);
    assert_eq!(log.lock().len(), 1);

    let stats = adapter.stats();
    assert_eq!(stats.interrupts, 2);
    assert_eq!(stats.drives[2].reads, 1);
    assert_eq!(stats.drives[2].read_blocks, 1);
}

#[test]
fn test_batch_completion() {
    let (adapter, sim) = quartz();
    let log = log();
    for target in 0..3 {
        adapter.submit(read_drive(&log, target)).unwrap();
    }
    assert_eq!(sim.outstanding(), vec![1, 2, 3]);

    sim.complete(&[3, 1, 2], 0);
    adapter.handle_interrupt();
    let good: Vec<_> = log.lock().iter().map(|d| d.result.is_good()).collect();
    assert_eq!(good, vec![true, true, true]);
    assert_eq!(adapter.free_slots(), crate::MAX_COMMANDS as usize);
}

#[test]
fn test_slot_exhaustion_fails_request() {
    let (adapter, sim) = attach_with(
        true,
        AdapterConfig::new().with_board(BoardFlags::QUARTZ).with_max_cmds(2),
    );
    let log = log();
    adapter.submit(read_drive(&log, 0)).unwrap();
    adapter.submit(read_drive(&log, 1)).unwrap();

    let req = read_drive(&log, 2);
    let id = req.id();
    assert_eq!(adapter.submit(req), Err(MegaError::NoFreeScb));
    assert_eq!(sim.issued().len(), 2);
    let done = log.lock();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, id);
    assert_eq!(done[0].result.host(), Some(HostByte::Error));
}

#[test]
fn test_64bit_transfer_address_relocated() {
    let (adapter, sim) = attach_with(
        true,
        AdapterConfig::new().with_board(BoardFlags::QUARTZ | BoardFlags::BIT64),
    );
    let log = log();
    adapter.submit(request(&log, 0, 1, &read10(8, 2), DataBuffer::Single(vec![0; 1024]))).unwrap();

    let fetched = last_issued(&sim);
    assert_eq!(fetched.decoded.cmd, cmd::LREAD64);
    assert_eq!(fetched.decoded.xferaddr, 0xFFFF_FFFF);
    assert_eq!(fetched.decoded.numsgelements, 1);
    assert_ne!(fetched.extension, 0);

    let mut element = [0u8; SG64_SIZE];
    sim.memory().read_phys(fetched.extension, &mut element);
    assert_ne!(u64::from_le_bytes(element[..8].try_into().unwrap()), 0);
    assert_eq!(u32::from_le_bytes(element[8..].try_into().unwrap()), 1024);
}

#[test]
fn test_scatter_gather_list() {
    let (adapter, sim) = quartz();
    let log = log();
    let data = DataBuffer::Scatter(vec![vec![0; 512], vec![0; 512], vec![0; 1024]]);
    adapter.submit(request(&log, 0, 1, &read10(0, 4), data)).unwrap();

    let fetched = last_issued(&sim).decoded;
    assert_eq!(fetched.numsgelements, 3);
    let mut element = [0u8; 8];
    sim.memory().read_phys(u64::from(fetched.xferaddr) + 16, &mut element);
    assert_eq!(u32::from_le_bytes(element[4..].try_into().unwrap()), 1024);

    let too_many = DataBuffer::Scatter(vec![vec![0; 512]; crate::MAX_SGLIST + 1]);
    let outcome = adapter.submit(request(&log, 0, 1, &read10(0, 27), too_many)).unwrap();
    assert_eq!(outcome, Submission::Completed);
    assert_eq!(log.lock()[0].result.host(), Some(HostByte::Error));
}

#[test]
fn test_mapping_failure_completes_with_error() {
    let (adapter, sim) = quartz();
    sim.memory().fail_maps(true);
    let log = log();
    assert_eq!(adapter.submit(read_drive(&log, 0)).unwrap(), Submission::Completed);
    assert_eq!(log.lock()[0].result.host(), Some(HostByte::Error));
    assert_eq!(adapter.free_slots(), crate::MAX_COMMANDS as usize);
    assert!(sim.issued().is_empty());
}

#[test]
fn test_unissued_reads_not_counted() {
    let (adapter, sim) = attach_with(
        true,
        AdapterConfig::new().with_board(BoardFlags::QUARTZ).with_max_cmds(2),
    );
    let log = log();
    adapter.submit(read_drive(&log, 0)).unwrap();
    adapter.submit(read_drive(&log, 1)).unwrap();
    assert_eq!(adapter.submit(read_drive(&log, 2)), Err(MegaError::NoFreeScb));

    sim.complete(&sim.outstanding(), 0);
    adapter.handle_interrupt();
    sim.memory().fail_maps(true);
    assert_eq!(adapter.submit(read_drive(&log, 3)).unwrap(), Submission::Completed);

    let stats = adapter.stats();
    assert_eq!(stats.drives[0].reads, 1);
    assert_eq!(stats.drives[1].reads, 1);
    assert_eq!(stats.drives[2].reads, 0);
    assert_eq!(stats.drives[3].reads, 0);
    assert_eq!(stats.drives[3].read_blocks, 0);
}

#[test]
fn test_port_board_command_path() {
    let (adapter, sim) = attach_with(false, AdapterConfig::new());
    assert!(!adapter.board().contains(BoardFlags::QUARTZ));
    let log = log();
    assert_eq!(adapter.submit(read_drive(&log, 1)).unwrap(), Submission::Issued);
    assert_eq!(last_issued(&sim).decoded.logdrv, 1);

    assert_eq!(adapter.handle_interrupt(), IrqReturn::None);
    sim.complete(&sim.outstanding(), 0);
    assert_eq!(adapter.handle_interrupt(), IrqReturn::Handled);
    assert!(log.lock()[0].result.is_good());
}

// =============================================================================
// LOCALLY ANSWERED AND REJECTED COMMANDS
// =============================================================================

#[test]
fn test_logical_rejections() {
    let (adapter, sim) = quartz();
    let log = log();

    let mut lun = read_drive(&log, 1);
    lun.lun = 1;
    adapter.submit(lun).unwrap();
    adapter.submit(read_drive(&log, crate::INITIATOR_ID)).unwrap();
    adapter.submit(request(&log, 3, 0, &read10(0, 1), DataBuffer::Single(vec![0; 512]))).unwrap();
    adapter.submit(request(&log, 0, 1, &[0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0], DataBuffer::None)).unwrap();

    let done = log.lock();
    assert_eq!(done.len(), 4);
    assert!(done.iter().all(|d| d.result.host() == Some(HostByte::BadTarget)));
    assert!(sim.issued().is_empty());
}

#[test]
fn test_block_count_over_limit_rejected() {
    let (adapter, sim) = quartz();
    let log = log();
    let cdb = [0xA8, 0, 0, 0, 0, 0, 0x00, 0x01, 0x00, 0x00, 0, 0];
    adapter.submit(request(&log, 0, 1, &cdb, DataBuffer::None)).unwrap();
    assert_eq!(log.lock()[0].result.host(), Some(HostByte::BadTarget));
    assert!(sim.issued().is_empty());
}

#[test]
fn test_unit_ready_and_mode_sense_answered_locally() {
    let (adapter, sim) = quartz();
    let log = log();
    let outcome = adapter
        .submit(request(&log, 0, 1, &[0; 6], DataBuffer::Single(vec![0xFF; 4])))
        .unwrap();
    assert_eq!(outcome, Submission::Completed);
    adapter
        .submit(request(&log, 0, 1, &[0x1A, 0, 0x3F, 0, 4, 0], DataBuffer::Single(vec![0xFF; 8])))
        .unwrap();

    let done = log.lock();
    assert!(done[0].result.is_good());
    assert_eq!(done[0].data, DataBuffer::Single(vec![0; 4]));
    assert!(done[1].result.is_good());
    assert_eq!(done[1].data, DataBuffer::Single(vec![0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]));
    assert!(sim.issued().is_empty());
}

#[test]
fn test_driver_info_request() {
    let (adapter, _sim) = quartz();
    let log = log();
    let outcome = adapter
        .submit(request(&log, 0, 0, &[0x82, 0x01, 0, 0, 0, 0], DataBuffer::Single(vec![0; 8])))
        .unwrap();
    assert_eq!(outcome, Submission::Completed);
    assert_eq!(log.lock()[0].data, DataBuffer::Single(vec![4, 0, 0, 0, 114, 0, 0, 0]));
}

// =============================================================================
// PASS-THROUGH
// =============================================================================

fn inquiry_data(peripheral: u8) -> Vec<u8> {
    let mut data = vec![0u8; 36];
    data[0] = peripheral;
    data[8..12].copy_from_slice(b"MEGA");
    data
}

#[test]
fn test_logical_inquiry_through_bounce_buffer() {
    let (adapter, sim) = quartz();
    sim.set_passthru_data(&inquiry_data(0x00));
    let log = log();
    adapter
        .submit(request(&log, 0, 1, &[0x12, 0, 0, 0, 36, 0], DataBuffer::Single(vec![0; 36])))
        .unwrap();
    assert_eq!(last_issued(&sim).decoded.cmd, cmd::PASSTHRU);
    assert_eq!(sim.memory().live_mappings(), 0);

    sim.complete(&sim.outstanding(), 0);
    adapter.handle_interrupt();
    let done = log.lock();
    assert!(done[0].result.is_good());
    assert_eq!(done[0].data, DataBuffer::Single(inquiry_data(0x00)));
}

#[test]
fn test_physical_disk_hidden_on_raid_channel() {
    let hal = SimHal::new(true);
    hal.set_chnl_class(0x01);
    let sim = hal.clone();
    let adapter = Adapter::attach(hal, AdapterConfig::new().with_board(BoardFlags::QUARTZ)).unwrap();
    let log = log();

    sim.set_passthru_data(&inquiry_data(0x00));
    adapter
        .submit(request(&log, PHYS_CHANNEL, 3, &[0x12, 0, 0, 0, 36, 0], DataBuffer::Single(vec![0; 36])))
        .unwrap();
    sim.complete(&sim.outstanding(), 0);
    adapter.handle_interrupt();

    sim.set_passthru_data(&inquiry_data(0x05));
    adapter
        .submit(request(&log, PHYS_CHANNEL, 4, &[0x12, 0, 0, 0, 36, 0], DataBuffer::Single(vec![0; 36])))
        .unwrap();
    sim.complete(&sim.outstanding(), 0);
    adapter.handle_interrupt();

    let done = log.lock();
    assert_eq!(done[0].result, ScsiResult::new(HostByte::BadTarget, 0xF0));
    assert!(done[1].result.is_good());
}

#[test]
fn test_physical_skip_id_rejected() {
    let (adapter, sim) = attach_with(
        true,
        AdapterConfig::new().with_board(BoardFlags::QUARTZ).with_skip_id(5),
    );
    let log = log();
    adapter.submit(request(&log, PHYS_CHANNEL, 5, &[0; 6], DataBuffer::None)).unwrap();
    adapter.submit(request(&log, PHYS_CHANNEL, 6, &[0; 6], DataBuffer::None)).unwrap();
    assert_eq!(log.lock()[0].result.host(), Some(HostByte::BadTarget));
    assert_eq!(sim.issued().len(), 1);
}

#[test]
fn test_physical_target_beyond_packed_byte_rejected() {
    let (adapter, sim) = quartz();
    let log = log();
    let outcome = adapter.submit(request(&log, PHYS_CHANNEL, 16, &[0; 6], DataBuffer::None)).unwrap();
    assert_eq!(outcome, Submission::Completed);
    assert_eq!(log.lock()[0].result.host(), Some(HostByte::BadTarget));
    assert!(sim.issued().is_empty());

    // The highest target that fits the low nibble still goes out
    let outcome = adapter.submit(request(&log, PHYS_CHANNEL, 15, &[0; 6], DataBuffer::None)).unwrap();
    assert_eq!(outcome, Submission::Issued);
    assert_eq!(sim.issued().len(), 1);
}

#[test]
fn test_long_cdb_uses_extended_passthru() {
    let (adapter, sim) = quartz();
    let log = log();
    let mut cdb = [0u8; 16];
    cdb[0] = 0x88;
    adapter.submit(request(&log, PHYS_CHANNEL, 2, &cdb, DataBuffer::Single(vec![0; 512]))).unwrap();
    assert_eq!(last_issued(&sim).decoded.cmd, cmd::EXTPASSTHRU);
}

#[test]
fn test_check_condition_copies_passthru_sense() {
    let (adapter, sim) = quartz();
    let mut sense = [0u8; crate::REQ_SENSE_LEN];
    sense[0] = 0x70;
    sense[2] = 0x05;
    sense[12] = 0x24;
    sim.set_passthru_sense(sense);
    let log = log();
    adapter.submit(request(&log, PHYS_CHANNEL, 1, &[0; 6], DataBuffer::None)).unwrap();
    sim.complete(&sim.outstanding(), 0x02);
    adapter.handle_interrupt();

    let done = log.lock();
    assert_eq!(done[0].result.status(), 0x02);
    assert_eq!(done[0].result.driver(), DRIVER_SENSE);
    assert_eq!(&done[0].sense[..crate::REQ_SENSE_LEN], &sense);
}

#[test]
fn test_check_condition_on_block_io() {
    let (adapter, sim) = quartz();
    let log = log();
    adapter.submit(read_drive(&log, 1)).unwrap();
    sim.complete(&sim.outstanding(), 0x02);
    adapter.handle_interrupt();

    let done = log.lock();
    assert_eq!(done[0].result, ScsiResult::new(HostByte::Ok, 0x02));
    assert_eq!(done[0].sense[0], 0x70);
    assert_eq!(done[0].sense[2], 0x0B);
}

#[test]
fn test_busy_and_unknown_status() {
    let (adapter, sim) = quartz();
    let log = log();
    adapter.submit(read_drive(&log, 1)).unwrap();
    sim.complete(&sim.outstanding(), 0x08);
    adapter.handle_interrupt();
    adapter.submit(read_drive(&log, 1)).unwrap();
    sim.complete(&sim.outstanding(), 0x0C);
    adapter.handle_interrupt();

    let done = log.lock();
    assert_eq!(done[0].result, ScsiResult::new(HostByte::BusBusy, 0x08));
    assert_eq!(done[1].result, ScsiResult::new(HostByte::BadTarget, 0x0C));
}

// =============================================================================
// INTERRUPTS
// =============================================================================

#[test]
fn test_spurious_interrupt_not_claimed() {
    let (adapter, _sim) = quartz();
    assert_eq!(adapter.handle_interrupt(), IrqReturn::None);
    assert_eq!(adapter.stats().interrupts, 0);
}

#[test]
fn test_wrong_command_id_ignored() {
    let (adapter, sim) = attach_with(
        true,
        AdapterConfig::new().with_board(BoardFlags::QUARTZ).with_max_cmds(4),
    );
    let log = log();
    adapter.submit(read_drive(&log, 1)).unwrap();
    sim.complete(&[0, 0x7D], 0);
    assert_eq!(adapter.handle_interrupt(), IrqReturn::Handled);
    assert!(log.lock().is_empty());
    assert_eq!(adapter.pending_count(), 1);
}

#[test]
fn test_busy_mailbox_queues_until_interrupt() {
    let (adapter, sim) = quartz();
    sim.hold_busy(true);
    let log = log();
    assert_eq!(adapter.submit(read_drive(&log, 1)).unwrap(), Submission::Issued);
    assert_eq!(adapter.submit(read_drive(&log, 2)).unwrap(), Submission::Queued);
    assert_eq!(sim.outstanding(), vec![1]);

    sim.hold_busy(false);
    sim.complete(&[1], 0);
    adapter.handle_interrupt();
    assert_eq!(sim.outstanding(), vec![2]);
    assert_eq!(last_issued(&sim).decoded.logdrv, 2);
    assert_eq!(log.lock().len(), 1);
}

// =============================================================================
// ABORT AND RESET
// =============================================================================

#[test]
fn test_abort_pending_and_issued() {
    let (adapter, sim) = quartz();
    sim.hold_busy(true);
    let log = log();
    let issued = read_drive(&log, 1);
    let issued_id = issued.id();
    let queued = read_drive(&log, 2);
    let queued_id = queued.id();
    adapter.submit(issued).unwrap();
    adapter.submit(queued).unwrap();

    assert_eq!(adapter.abort(queued_id), AbortOutcome::Success);
    assert_eq!(log.lock()[0].result.host(), Some(HostByte::Abort));
    assert_eq!(adapter.abort(queued_id), AbortOutcome::NotRunning);

    assert_eq!(adapter.abort(issued_id), AbortOutcome::NotRunning);
    assert_eq!(adapter.abort(issued_id), AbortOutcome::Snooze);

    // The aborted command still completes normally
    sim.hold_busy(false);
    sim.complete(&[1], 0);
    adapter.handle_interrupt();
    let done = log.lock();
    assert_eq!(done.len(), 2);
    assert_eq!(done[1].id, issued_id);
    assert!(done[1].result.is_good());
    assert_eq!(adapter.free_slots(), crate::MAX_COMMANDS as usize);
}

#[test]
fn test_reset_completes_each_request_once() {
    let (adapter, sim) = quartz();
    sim.hold_busy(true);
    let log = log();
    adapter.submit(read_drive(&log, 1)).unwrap();
    adapter.submit(read_drive(&log, 2)).unwrap();

    let outcome = adapter.reset(RequestId::new());
    assert_eq!(outcome.reset, 2);
    assert_eq!(log.lock().len(), 2);
    assert!(log.lock().iter().all(|d| d.result.host() == Some(HostByte::Reset)));
    // The issued slot stays with the firmware until its id comes back
    assert_eq!(adapter.free_slots(), crate::MAX_COMMANDS as usize - 1);
    assert_eq!(adapter.reset(RequestId::new()).reset, 0);

    sim.hold_busy(false);
    sim.complete(&[1], 0);
    adapter.handle_interrupt();
    assert_eq!(log.lock().len(), 2);
    assert_eq!(adapter.free_slots(), crate::MAX_COMMANDS as usize);
    assert_eq!(sim.memory().live_mappings(), 0);
}

// =============================================================================
// LOGICAL DRIVE DELETION
// =============================================================================

#[test]
fn test_delete_requires_firmware_support() {
    let hal = SimHal::new(true);
    hal.set_status(cmd::MISC, subop::SUP_DEL_LOGDRV, 0x01);
    let adapter = Adapter::attach(hal, AdapterConfig::new().with_board(BoardFlags::QUARTZ)).unwrap();
    assert_eq!(adapter.delete_logical_drive(1), Err(MegaError::Unsupported));
}

#[test]
fn test_delete_idle_adapter() {
    let (adapter, sim) = quartz();
    adapter.delete_logical_drive(1).unwrap();
    assert_eq!(sim.sim_clock().sleeps(), 0);
    assert_eq!(adapter.quiesce_state(), QuiesceState::Normal);
    let delete = sim.fetched().into_iter().find(|f| f.image[2] == subop::DEL_LOGDRV).unwrap();
    assert_eq!(delete.decoded.cmd, cmd::MISC);
    assert_eq!(delete.image[3], 1);

    let log = log();
    adapter.submit(read_drive(&log, 2)).unwrap();
    assert_eq!(last_issued(&sim).decoded.logdrv, 0x82);
}

#[test]
fn test_delete_defers_and_renumbers() {
    let (adapter, sim) = attach_with(
        true,
        AdapterConfig::new().with_board(BoardFlags::QUARTZ).with_drain(1, None),
    );
    let log = log();
    adapter.submit(read_drive(&log, 2)).unwrap();
    assert_eq!(last_issued(&sim).decoded.logdrv, 2);

    std::thread::scope(|s| {
        let deleting = s.spawn(|| adapter.delete_logical_drive(1));
        wait_for(|| adapter.quiesce_state() == QuiesceState::Quiescing);

        assert_eq!(adapter.submit(read_drive(&log, 3)).unwrap(), Submission::Deferred);
        assert_eq!(sim.issued().len(), 1);

        sim.complete(&[1], 0);
        adapter.handle_interrupt();
        assert_eq!(deleting.join().unwrap(), Ok(()));
    });

    assert_eq!(adapter.quiesce_state(), QuiesceState::Normal);
    assert_eq!(sim.issued().len(), 2);
    assert_eq!(last_issued(&sim).decoded.logdrv, 0x83);
    assert!(sim.sim_clock().sleeps() > 0);
}

#[test]
fn test_failed_delete_restores_normal() {
    let (adapter, sim) = quartz();
    sim.set_status(cmd::MISC, subop::DEL_LOGDRV, 0x03);
    assert_eq!(adapter.delete_logical_drive(1), Err(MegaError::CommandFailed(0x03)));
    assert_eq!(adapter.quiesce_state(), QuiesceState::Normal);

    let log = log();
    adapter.submit(read_drive(&log, 2)).unwrap();
    assert_eq!(last_issued(&sim).decoded.logdrv, 2);
}

#[test]
fn test_drain_timeout() {
    let (adapter, sim) = attach_with(
        true,
        AdapterConfig::new().with_board(BoardFlags::QUARTZ).with_drain(1, Some(3)),
    );
    let log = log();
    adapter.submit(read_drive(&log, 2)).unwrap();
    assert_eq!(adapter.delete_logical_drive(1), Err(MegaError::DrainTimeout));
    assert_eq!(adapter.quiesce_state(), QuiesceState::Normal);
    assert!(!sim.fetched().iter().any(|f| f.image[2] == subop::DEL_LOGDRV && f.decoded.cmd == cmd::MISC));
}

// =============================================================================
// IOCTL
// =============================================================================

fn adapter_inquiry() -> IoctlCommand {
    let mut mailbox = [0u8; 16];
    mailbox[0] = cmd::ADAPTERINQ;
    IoctlCommand { mailbox, passthru: None, data: vec![0; 16] }
}

#[test]
fn test_ioctl_waits_for_interrupt() {
    let (adapter, sim) = quartz();
    std::thread::scope(|s| {
        let waiter = s.spawn(|| adapter.ioctl(adapter_inquiry()));
        wait_for(|| !sim.outstanding().is_empty());

        let fetched = last_issued(&sim);
        sim.memory().write_phys(u64::from(fetched.decoded.xferaddr), &[1, 2, 3, 4]);
        sim.complete(&sim.outstanding(), 0);
        adapter.handle_interrupt();

        let reply = waiter.join().unwrap().unwrap();
        assert_eq!(reply.status, 0);
        assert_eq!(&reply.data[..4], &[1, 2, 3, 4]);
        assert!(reply.sense.is_none());
    });
    assert_eq!(adapter.free_slots(), crate::MAX_COMMANDS as usize);
}

#[test]
fn test_ioctl_swept_by_reset() {
    let (adapter, sim) = quartz();
    let regions = sim.memory().live_regions();
    std::thread::scope(|s| {
        let waiter = s.spawn(|| adapter.ioctl(adapter_inquiry()));
        wait_for(|| !sim.outstanding().is_empty());
        assert_eq!(adapter.reset(RequestId::new()).reset, 1);
        assert_eq!(waiter.join().unwrap(), Err(MegaError::Reset));
    });

    sim.complete(&sim.outstanding(), 0);
    adapter.handle_interrupt();
    assert_eq!(adapter.free_slots(), crate::MAX_COMMANDS as usize);
    assert_eq!(sim.memory().live_regions(), regions);
}

#[test]
fn test_ioctl_passthru_on_64bit_board() {
    let (adapter, sim) = attach_with(
        true,
        AdapterConfig::new().with_board(BoardFlags::QUARTZ | BoardFlags::BIT64),
    );
    let mut sense = [0u8; crate::REQ_SENSE_LEN];
    sense[0] = 0x70;
    sense[2] = 0x03;
    sense[12] = 0x11;
    sim.set_passthru_sense(sense);

    let mut cdb = [0u8; 10];
    cdb[0] = 0x08;
    cdb[4] = 1;
    let pthru = PassThru {
        channel: 0,
        target: 1,
        cdb,
        cdblen: 6,
        reqsenselen: crate::REQ_SENSE_LEN as u8,
        ars: true,
        ..PassThru::default()
    };
    let command = IoctlCommand { mailbox: [0; 16], passthru: Some(pthru), data: vec![0; 64] };

    std::thread::scope(|s| {
        let waiter = s.spawn(|| adapter.ioctl(command));
        wait_for(|| !sim.outstanding().is_empty());

        let fetched = last_issued(&sim).decoded;
        assert_eq!(fetched.cmd, cmd::PASSTHRU64);

        let mut desc = [0u8; PASSTHRU_SIZE];
        sim.memory().read_phys(u64::from(fetched.xferaddr), &mut desc);
        assert_eq!(desc[50], 1);
        let sg = u32::from_le_bytes(desc[52..56].try_into().unwrap());
        let mut element = [0u8; SG64_SIZE];
        sim.memory().read_phys(u64::from(sg), &mut element);
        assert_eq!(u32::from_le_bytes(element[8..].try_into().unwrap()), 64);

        // The single element points at the staging buffer
        let staging = u64::from_le_bytes(element[..8].try_into().unwrap());
        sim.memory().write_phys(staging, &[0xAA, 0xBB]);
        sim.complete(&sim.outstanding(), 0x02);
        adapter.handle_interrupt();

        let reply = waiter.join().unwrap().unwrap();
        assert_eq!(reply.status, 0x02);
        assert_eq!(&reply.data[..2], &[0xAA, 0xBB]);
        assert_eq!(reply.sense, Some(sense));
    });
    assert_eq!(adapter.free_slots(), crate::MAX_COMMANDS as usize);
}

// =============================================================================
// DETACH AND REGISTRY
// =============================================================================

#[test]
fn test_detach_fails_outstanding_and_frees_memory() {
    let (adapter, sim) = quartz();
    let log = log();
    adapter.submit(read_drive(&log, 1)).unwrap();
    adapter.detach().unwrap();

    assert_eq!(log.lock()[0].result.host(), Some(HostByte::NoConnect));
    assert!(sim.fetched().iter().any(|f| f.privileged && f.decoded.cmd == cmd::FLUSH_CACHE));
    assert_eq!(sim.memory().live_regions(), 0);
}

#[test]
fn test_registry_dispatches_shared_interrupt() {
    let registry = AdapterRegistry::new();
    let (first, first_sim) = quartz();
    let (second, _second_sim) = quartz();
    let log = log();
    first.submit(read_drive(&log, 1)).unwrap();

    let first_id = registry.register(first);
    let second_id = registry.register(second);
    assert_ne!(first_id, second_id);
    assert_eq!(registry.len(), 2);

    assert_eq!(registry.dispatch_interrupt(), IrqReturn::None);
    first_sim.complete(&first_sim.outstanding(), 0);
    assert_eq!(registry.dispatch_interrupt(), IrqReturn::Handled);
    assert_eq!(log.lock().len(), 1);

    let removed = registry.unregister(second_id).unwrap();
    assert_eq!(removed.name(), "megaraid-sim");
    assert!(registry.get(second_id).is_none());
    assert!(registry.get(first_id).is_some());
    assert_eq!(registry.len(), 1);
}
