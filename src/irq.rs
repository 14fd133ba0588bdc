//! Interrupt top-half and bottom-half.
//!
//! The top-half ([`Device::isr()`]) runs in interrupt context.  It checks the
//! interrupt is ours, copies the whole handshake channel into a snapshot slot
//! and asks for the bottom-half.  It never blocks, allocates or calls back into
//! the application.
//!
//! The bottom-half ([`Device::dsr()`]) runs in thread context.  It takes the
//! snapshot, works out what changed since the last one, updates the channels'
//! cached flags, wakes waiters and runs notification callbacks.
//!
//! The two are coupled by a pair of snapshot slots.  The top-half writes the
//! slot selected by the write index.  The bottom-half flips the index before
//! reading, so the next interrupt lands in the other slot.  If the bottom-half
//! falls behind, the top-half overwrites the unconsumed snapshot: only the
//! latest state is ever processed, and intermediate changes that reverted in
//! between are lost.  The bottom-half does not try to recover them.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::vec::Vec;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use spin::Mutex;

use crate::channel::{ChannelKind, ChannelRef, Notification};
use crate::device::Device;
use crate::dpm::{
    self, CommCos, HandshakeWidth, MAX_HANDSHAKE_CELLS, NetxSysFlags, bit_mask, global_regs,
};
use crate::os::{Event, Os};
use crate::transport::Transport;
use crate::Result;

/// A snapshot of every handshake cell
pub(crate) type Snapshot = [u32; MAX_HANDSHAKE_CELLS];

/// What the top-half found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsrResult {
    /// Not raised by this device, or this device is not in a state to raise
    /// it.  On a shared line, pass it on.
    OtherDevice,
    /// Ours, but there is nothing for the bottom-half to do
    Handled,
    /// Ours; run [`Device::dsr()`]
    ScheduleDsr,
}

#[derive(Debug)]
struct IrqSlot {
    valid: AtomicBool,
    cells: Mutex<Snapshot>,
}

impl IrqSlot {
    const fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            cells: Mutex::new([0; MAX_HANDSHAKE_CELLS]),
        }
    }
}

/// Double-buffered handoff between top-half and bottom-half
#[derive(Debug)]
pub(crate) struct IrqExchange {
    write_index: AtomicUsize,
    slots: [IrqSlot; 2],
}

impl IrqExchange {
    pub(crate) const fn new() -> Self {
        Self {
            write_index: AtomicUsize::new(0),
            slots: [IrqSlot::new(), IrqSlot::new()],
        }
    }

    /// Drop any unconsumed snapshot
    pub(crate) fn invalidate(&self) {
        for slot in self.slots.iter() {
            slot.valid.store(false, Ordering::Release);
        }
    }

    /// Number of snapshots waiting for the bottom-half
    pub(crate) fn pending(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.valid.load(Ordering::Acquire))
            .count()
    }
}

fn read_snapshot(transport: &dyn Transport, cells: &mut Snapshot) -> Result<()> {
    let mut raw = [0u8; dpm::HANDSHAKE_CHANNEL_SIZE as usize];
    transport.read(dpm::HANDSHAKE_CHANNEL_OFFSET, &mut raw)?;
    for (cell, bytes) in cells.iter_mut().zip(raw.chunks_exact(4)) {
        *cell = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    Ok(())
}

impl<O: Os> Device<O> {
    /// Interrupt top-half.
    ///
    /// Safe to call from interrupt context.  Returns
    /// [`IsrResult::ScheduleDsr`] when [`Self::dsr()`] must be run.
    pub fn isr(&self) -> IsrResult {
        let transport = self.transport();

        match transport.read_u32(0) {
            Ok(dpm::INVALID_CONTENT) | Err(_) => return IsrResult::OtherDevice,
            Ok(_) => {}
        }

        if !self.irq_enabled() {
            error!("{}: interrupt while interrupts are disabled", self.name());
            return IsrResult::OtherDevice;
        }

        if let Some(regs) = self.global_regs() {
            let Ok(status) = transport.read_u32(regs + global_regs::IRQ_STATUS) else {
                return IsrResult::OtherDevice;
            };
            let pending = status & global_regs::IRQ_HANDSHAKE_MASK;
            if pending == 0 {
                return IsrResult::OtherDevice;
            }
            // Acknowledge before taking the snapshot, so a change racing with
            // the acknowledge raises a fresh interrupt
            if transport
                .write_u32(regs + global_regs::IRQ_STATUS, pending)
                .is_err()
            {
                return IsrResult::OtherDevice;
            }
        }

        let exchange = &self.irq;
        let index = exchange.write_index.load(Ordering::Acquire);
        let slot = [index, index ^ 1]
            .into_iter()
            .find_map(|ii| {
                let slot = &exchange.slots[ii];
                slot.cells.try_lock().map(|cells| (slot, cells))
            });
        let Some((slot, mut cells)) = slot else {
            return IsrResult::Handled;
        };
        if read_snapshot(transport, &mut cells).is_err() {
            return IsrResult::Handled;
        }
        slot.valid.store(true, Ordering::Release);
        IsrResult::ScheduleDsr
    }

    /// Interrupt bottom-half.
    ///
    /// Call from thread context after [`Self::isr()`] returned
    /// [`IsrResult::ScheduleDsr`].  Does nothing while a reset is in
    /// progress.
    pub fn dsr(&self) -> Result<()> {
        if self.reset_active() {
            return Ok(());
        }
        let index = self.irq.write_index.fetch_xor(1, Ordering::AcqRel);
        let slot = &self.irq.slots[index];
        if !slot.valid.load(Ordering::Acquire) {
            return Ok(());
        }
        let cells = {
            let cells = slot.cells.lock();
            slot.valid.store(false, Ordering::Release);
            *cells
        };
        self.process_snapshot(&cells)
    }

    /// Take a fresh snapshot and process it, as an interrupt would
    pub(crate) fn replay_interrupt(&self) -> Result<()> {
        let mut cells = [0u32; MAX_HANDSHAKE_CELLS];
        read_snapshot(self.transport(), &mut cells)?;
        self.process_snapshot(&cells)
    }

    pub(crate) fn process_snapshot(&self, cells: &Snapshot) -> Result<()> {
        let sys_cell = cells[dpm::SYSTEM_BLOCK_ID as usize];
        let sys_netx = HandshakeWidth::Bits8.netx_from_cell(sys_cell);
        if sys_netx & NetxSysFlags::READY.bits() == 0 {
            trace!("{}: device not ready, snapshot ignored", self.name());
            return Ok(());
        }

        self.process_sync(cells[dpm::SYNC_BLOCK_ID as usize]);

        for ch in self.channels() {
            let cell = cells[ch.channel.block_id as usize];
            let new = ch.channel.width.netx_from_cell(cell);
            let (changed, notes) = process_channel(&ch, new)?;
            for bit in 0..dpm::HANDSHAKE_BITS {
                if changed & (1 << bit) != 0 {
                    ch.channel.events[bit].set();
                }
            }
            ch.channel.notify(&notes);
        }
        Ok(())
    }
}

/// Apply a new device flags word to a channel.  Returns the changed bits and
/// the notifications to deliver once the state lock is released.
fn process_channel<O: Os>(
    ch: &ChannelRef<'_, O>,
    new: u16,
) -> Result<(u16, Vec<Notification>)> {
    let mut notes = Vec::new();
    let mut st = ch.lock_state();

    let changed = st.netx_flags ^ new;
    st.netx_flags = new;
    let unequal = st.host_flags ^ new;
    let comm = matches!(ch.channel.kind, ChannelKind::Communication(_));

    if unequal & bit_mask(dpm::NETX_COS_BIT) != 0 {
        ch.take_device_cos_locked(&mut st)?;
        notes.push(Notification::CosChanged {
            cos: CommCos::from_bits_retain(st.device_cos),
            changed: CommCos::from_bits_retain(st.device_cos_changed),
        });
    }

    let ready = bit_mask(dpm::READY_BIT);
    if comm && changed & ready != 0 {
        notes.push(Notification::ComState {
            communicating: new & ready != 0,
        });
    }

    let recv = &ch.channel.recv_mbx;
    let recv_mask = bit_mask(recv.bit);
    if changed & recv_mask != 0 && unequal & recv_mask != 0 {
        let waiting = ch.transport().read_u16(recv.counter)?;
        notes.push(Notification::RecvMailboxFull { waiting });
    }

    let send_mask = bit_mask(ch.channel.send_mbx.bit);
    if changed & send_mask != 0 && unequal & send_mask == 0 {
        notes.push(Notification::SendMailboxEmpty);
    }

    for area in ch.channel.io_areas.iter() {
        if let Some(policy) = area.policy {
            if changed & bit_mask(area.bit) != 0 && st.bit_state(area.bit, policy) {
                notes.push(Notification::IoArea { area: area.id });
            }
        }
    }

    ch.flush_deferred_cos_locked(&mut st)?;
    Ok((changed, notes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BitState, NotifyKind};
    use crate::config::{DeviceConfig, IrqMode};
    use crate::dpm::AppCos;
    use crate::io::IoAreaId;
    use crate::os::StdOs;
    use crate::testutil::{SIM_COMM_BLOCK, SimDpm};
    use alloc::sync::Arc;
    use alloc::vec;

    fn attach(sim: &SimDpm, config: DeviceConfig) -> Device<StdOs> {
        let device = Device::attach(sim.mmio(), StdOs::new(), config).unwrap();
        device.enable_irq().unwrap();
        device
    }

    fn irq_config() -> DeviceConfig {
        DeviceConfig::default().with_irq_mode(IrqMode::Interrupt)
    }

    fn record(device: &Device<StdOs>) -> Arc<Mutex<Vec<Notification>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ch = device.channel(0).unwrap();
        for kind in [
            NotifyKind::RecvMailboxFull,
            NotifyKind::SendMailboxEmpty,
            NotifyKind::IoArea,
            NotifyKind::ComState,
            NotifyKind::CosChanged,
        ] {
            let seen = seen.clone();
            ch.register_notification(kind, move |note| seen.lock().push(*note));
        }
        seen
    }

    #[test]
    fn test_invalid_content_is_other_device() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, irq_config());
        sim.set_netx(SIM_COMM_BLOCK, bit_mask(dpm::RECV_MBX_BIT));
        sim.mmio().write_u32(0, dpm::INVALID_CONTENT).unwrap();

        assert_eq!(device.isr(), IsrResult::OtherDevice);
        assert_eq!(device.irq.pending(), 0);
        device.dsr().unwrap();
        assert_eq!(device.channel(0).unwrap().netx_flags(), 0);
    }

    #[test]
    fn test_disabled_interrupt_is_other_device() {
        let sim = SimDpm::firmware();
        let device = Device::attach(sim.mmio(), StdOs::new(), irq_config()).unwrap();
        assert_eq!(device.isr(), IsrResult::OtherDevice);
        assert_eq!(device.irq.pending(), 0);
    }

    #[test]
    fn test_mailbox_and_state_notifications() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, irq_config());
        let seen = record(&device);

        sim.deliver(&[0u8; 40]);
        sim.toggle_netx(SIM_COMM_BLOCK, bit_mask(dpm::READY_BIT));
        assert_eq!(device.isr(), IsrResult::ScheduleDsr);
        device.dsr().unwrap();

        let notes = seen.lock().clone();
        assert!(notes.contains(&Notification::RecvMailboxFull { waiting: 1 }));
        assert!(notes.contains(&Notification::ComState {
            communicating: true
        }));
        let ch = device.channel(0).unwrap();
        assert_eq!(
            ch.wait_for_bit_state(dpm::RECV_MBX_BIT, BitState::NotEqual, 0),
            Ok(true)
        );

        // Host takes the packet: the device's flags do not change, no new
        // notifications
        let mut buf = [0u8; 64];
        ch.get_packet(&mut buf, 0).unwrap();
        seen.lock().clear();
        assert_eq!(device.isr(), IsrResult::ScheduleDsr);
        device.dsr().unwrap();
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_send_empty_and_io_notifications() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, irq_config());
        let seen = record(&device);
        let ch = device.channel(0).unwrap();

        ch.put_packet(&crate::packet::Packet::request(0, 0x100, 1), 0)
            .unwrap();
        ch.io_write(IoAreaId::Pd0Output, 0, &[1], 0).unwrap();
        sim.ack(
            SIM_COMM_BLOCK,
            bit_mask(dpm::SEND_MBX_BIT) | bit_mask(dpm::PD0_OUT_BIT),
        );
        device.isr();
        device.dsr().unwrap();

        let notes = seen.lock().clone();
        assert_eq!(
            notes,
            vec![
                Notification::SendMailboxEmpty,
                Notification::IoArea {
                    area: IoAreaId::Pd0Output
                }
            ]
        );
    }

    #[test]
    fn test_cos_change_acknowledged_and_reported() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, irq_config());
        let seen = record(&device);

        sim.set_comm_cos(CommCos::READY | CommCos::RUN | CommCos::BUS_ON);
        sim.toggle_netx(SIM_COMM_BLOCK, bit_mask(dpm::NETX_COS_BIT));
        device.isr();
        device.dsr().unwrap();

        assert_eq!(
            seen.lock().clone(),
            vec![Notification::CosChanged {
                cos: CommCos::READY | CommCos::RUN | CommCos::BUS_ON,
                changed: CommCos::BUS_ON,
            }]
        );
        assert!(!sim.pending(SIM_COMM_BLOCK, bit_mask(dpm::NETX_COS_BIT)));
    }

    #[test]
    fn test_deferred_cos_flushed_by_dsr() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, irq_config());
        let ch = device.channel(0).unwrap();
        let host_cos = bit_mask(dpm::HOST_COS_BIT);

        ch.toggle_bit(host_cos).unwrap();
        ch.set_bus_state(true, 0).unwrap();
        assert_eq!(sim.app_cos(), AppCos::empty());

        sim.ack(SIM_COMM_BLOCK, host_cos);
        device.isr();
        device.dsr().unwrap();
        assert_eq!(sim.app_cos(), AppCos::BUS_ON | AppCos::BUS_ON_ENABLE);
    }

    #[test]
    fn test_overwrite_when_dsr_falls_behind() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, irq_config());
        let recv = bit_mask(dpm::RECV_MBX_BIT);

        sim.toggle_netx(SIM_COMM_BLOCK, recv);
        assert_eq!(device.isr(), IsrResult::ScheduleDsr);
        sim.toggle_netx(SIM_COMM_BLOCK, recv);
        assert_eq!(device.isr(), IsrResult::ScheduleDsr);
        assert_eq!(device.irq.pending(), 1);

        // Only the latest state is seen: the bit went and came back
        device.dsr().unwrap();
        assert_eq!(device.channel(0).unwrap().netx_flags(), 0);
        assert_eq!(device.irq.pending(), 0);
        // Nothing left for a second run
        device.dsr().unwrap();
    }

    #[test]
    fn test_dsr_ignored_during_reset() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, irq_config());
        sim.toggle_netx(SIM_COMM_BLOCK, bit_mask(dpm::RECV_MBX_BIT));
        device.isr();
        device.set_reset_active(true);
        device.dsr().unwrap();
        assert_eq!(device.channel(0).unwrap().netx_flags(), 0);
        device.set_reset_active(false);
        device.dsr().unwrap();
        assert_eq!(
            device.channel(0).unwrap().netx_flags(),
            bit_mask(dpm::RECV_MBX_BIT)
        );
    }

    #[test]
    fn test_event_driven_wait_woken_by_dsr() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, irq_config());
        let ch = device.channel(0).unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                sim.toggle_netx(SIM_COMM_BLOCK, bit_mask(dpm::RECV_MBX_BIT));
                if device.isr() == IsrResult::ScheduleDsr {
                    device.dsr().unwrap();
                }
            });
            assert_eq!(
                ch.wait_for_bit_state(dpm::RECV_MBX_BIT, BitState::NotEqual, 2000),
                Ok(true)
            );
        });
    }

    #[test]
    fn test_shared_line_gating() {
        let sim = SimDpm::firmware();
        let device = attach(&sim, irq_config().with_shared_irq_line(true));
        let regs = device.global_regs().unwrap();
        let mmio = sim.mmio();
        assert_eq!(
            mmio.read_u32(regs + global_regs::IRQ_ENABLE).unwrap(),
            global_regs::IRQ_GLOBAL_ENABLE | global_regs::IRQ_HANDSHAKE_MASK
        );

        assert_eq!(device.isr(), IsrResult::OtherDevice);

        // Simulated hardware: status bits are cleared by writing them back,
        // which the sim cannot do, so check the acknowledge value instead
        mmio.write_u32(regs + global_regs::IRQ_STATUS, 0x0000_0004)
            .unwrap();
        assert_eq!(device.isr(), IsrResult::ScheduleDsr);
        assert_eq!(mmio.read_u32(regs + global_regs::IRQ_STATUS).unwrap(), 4);
    }
}
