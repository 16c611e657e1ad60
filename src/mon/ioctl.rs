//! Device-control surface of the monitor.
//!
//! Request codes arrive as 32-bit device-control words; buffers are
//! validated strictly, and the only requests that may legitimately be
//! retried with a bigger buffer report the required size. The
//! kernel-to-kernel notifications (capture started/stopped) do not pass
//! through here; they are direct calls on [`Monitor`].

use bit_field::BitField;
use num_traits::FromPrimitive;

use crate::cmdq::htable::HTableHandle;
use crate::mon::filter::{FilterKind, Match, UsbFilter};
use crate::mon::{MonCtx, Monitor};
use crate::status::{Error, Result};

/// Interface version reported to clients.
pub const MON_MAJOR_VERSION: u32 = 5;
pub const MON_MINOR_VERSION: u32 = 0;

/// Device type field of the monitor's control codes.
pub const MON_DEVICE_TYPE: u32 = 0x8011;

const METHOD_BUFFERED: u32 = 0;

/// Monitor request codes (the function field of the control word).
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive)]
#[repr(u32)]
pub enum MonFunction {
    GetVersion = 0x600,
    AddFilter = 0x601,
    RemoveFilter = 0x602,
    RunFilters = 0x603,
    GetDevice = 0x604,
}

/// Builds the control word for a request, the standard device-control
/// layout: device type, function, method.
pub fn mon_ctl_code(function: MonFunction) -> u32 {
    let mut code = 0u32;
    let _ = code.set_bits(16..32, MON_DEVICE_TYPE);
    let _ = code.set_bits(2..14, function as u32);
    let _ = code.set_bits(0..2, METHOD_BUFFERED);
    code
}

fn decode_ctl_code(code: u32) -> Result<MonFunction> {
    if code.get_bits(16..32) != MON_DEVICE_TYPE {
        return Err(Error::NotSupported);
    }
    MonFunction::from_u32(code.get_bits(2..14)).ok_or(Error::InvalidParameter)
}

/// Wire size of a filter specification.
pub const FILTER_WIRE_SIZE: usize = 12;

const EXACT_VENDOR: u8 = 1 << 0;
const EXACT_PRODUCT: u8 = 1 << 1;
const EXACT_REVISION: u8 = 1 << 2;
const EXACT_CLASS: u8 = 1 << 3;
const EXACT_SUBCLASS: u8 = 1 << 4;
const EXACT_PROTOCOL: u8 = 1 << 5;

fn kind_from_wire(value: u8) -> Result<FilterKind> {
    Ok(match value {
        0 => FilterKind::OneshotIgnore,
        1 => FilterKind::Ignore,
        2 => FilterKind::OneshotCapture,
        3 => FilterKind::Capture,
        _ => return Err(Error::InvalidParameter),
    })
}

fn kind_to_wire(kind: FilterKind) -> u8 {
    match kind {
        FilterKind::OneshotIgnore => 0,
        FilterKind::Ignore => 1,
        FilterKind::OneshotCapture => 2,
        FilterKind::Capture => 3,
    }
}

fn match_u16(flags: u8, bit: u8, value: u16) -> Match<u16> {
    if flags & bit != 0 {
        Match::Exact(value)
    } else {
        Match::Any
    }
}

fn match_u8(flags: u8, bit: u8, value: u8) -> Match<u8> {
    if flags & bit != 0 {
        Match::Exact(value)
    } else {
        Match::Any
    }
}

/// Decodes a wire filter specification.
pub fn decode_filter(data: &[u8]) -> Result<UsbFilter> {
    if data.len() != FILTER_WIRE_SIZE {
        return Err(Error::InvalidParameter);
    }
    let kind = kind_from_wire(data[0])?;
    let flags = data[1];
    Ok(UsbFilter {
        kind,
        vendor: match_u16(flags, EXACT_VENDOR, u16::from_le_bytes([data[2], data[3]])),
        product: match_u16(flags, EXACT_PRODUCT, u16::from_le_bytes([data[4], data[5]])),
        revision: match_u16(flags, EXACT_REVISION, u16::from_le_bytes([data[6], data[7]])),
        class: match_u8(flags, EXACT_CLASS, data[8]),
        subclass: match_u8(flags, EXACT_SUBCLASS, data[9]),
        protocol: match_u8(flags, EXACT_PROTOCOL, data[10]),
    })
}

/// Encodes a filter specification for submission.
pub fn encode_filter(filter: &UsbFilter, out: &mut [u8; FILTER_WIRE_SIZE]) {
    let mut flags = 0u8;
    let mut put_u16 = |slot: &mut [u8], m: Match<u16>, bit: u8, flags: &mut u8| {
        if let Match::Exact(v) = m {
            *flags |= bit;
            slot.copy_from_slice(&v.to_le_bytes());
        }
    };
    out.fill(0);
    out[0] = kind_to_wire(filter.kind);
    put_u16(&mut out[2..4], filter.vendor, EXACT_VENDOR, &mut flags);
    put_u16(&mut out[4..6], filter.product, EXACT_PRODUCT, &mut flags);
    put_u16(&mut out[6..8], filter.revision, EXACT_REVISION, &mut flags);
    if let Match::Exact(v) = filter.class {
        flags |= EXACT_CLASS;
        out[8] = v;
    }
    if let Match::Exact(v) = filter.subclass {
        flags |= EXACT_SUBCLASS;
        out[9] = v;
    }
    if let Match::Exact(v) = filter.protocol {
        flags |= EXACT_PROTOCOL;
        out[10] = v;
    }
    out[1] = flags;
}

/// Dispatches one device-control request for an open monitor client.
/// Returns the number of bytes written to `output`.
pub fn ioctl(
    monitor: &Monitor,
    ctx: &MonCtx,
    code: u32,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize> {
    let function = decode_ctl_code(code)?;
    log::trace!("monitor ioctl {function:?}");
    match function {
        MonFunction::GetVersion => {
            if !input.is_empty() || output.len() != 8 {
                log::warn!(
                    "GetVersion: invalid sizes, in {} (expected 0) out {} (expected 8)",
                    input.len(),
                    output.len()
                );
                return Err(Error::InvalidParameter);
            }
            output[0..4].copy_from_slice(&MON_MAJOR_VERSION.to_le_bytes());
            output[4..8].copy_from_slice(&MON_MINOR_VERSION.to_le_bytes());
            Ok(8)
        }

        MonFunction::AddFilter => {
            if input.len() != FILTER_WIRE_SIZE || output.len() != 4 {
                log::warn!(
                    "AddFilter: invalid sizes, in {} (expected {FILTER_WIRE_SIZE}) out {} (expected 4)",
                    input.len(),
                    output.len()
                );
                return Err(Error::InvalidParameter);
            }
            let filter = decode_filter(input)?;
            let id = monitor.filter_engine().filter_add(ctx.filter_ctx(), filter)?;
            output[0..4].copy_from_slice(&id.raw().to_le_bytes());
            Ok(4)
        }

        MonFunction::RemoveFilter => {
            if input.len() != 4 || !output.is_empty() {
                log::warn!(
                    "RemoveFilter: invalid sizes, in {} (expected 4) out {} (expected 0)",
                    input.len(),
                    output.len()
                );
                return Err(Error::InvalidParameter);
            }
            let id = HTableHandle::from_raw(u32::from_le_bytes(input.try_into().unwrap()));
            monitor.filter_engine().filter_remove(ctx.filter_ctx(), id)?;
            Ok(0)
        }

        MonFunction::RunFilters => {
            if !input.is_empty() || !output.is_empty() {
                log::warn!("RunFilters: unexpected buffers");
                return Err(Error::InvalidParameter);
            }
            monitor.filter_engine().run_filters(ctx.filter_ctx())?;
            Ok(0)
        }

        MonFunction::GetDevice => {
            if input.len() != 8 {
                log::warn!("GetDevice: invalid input size {}", input.len());
                return Err(Error::InvalidParameter);
            }
            if output.len() < 4 {
                return Err(Error::BufferTooSmall { required: 4 });
            }
            let pdo = crate::bus::PdoId(u64::from_le_bytes(input.try_into().unwrap()));
            let filtered = monitor.filter_engine().pdo_is_filtered(pdo);
            output[0] = u8::from(filtered);
            output[1..4].fill(0);
            Ok(4)
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;

    use super::*;
    use crate::bus::{PdoId, UsbBus, UsbDeviceDesc};
    use crate::platform::PlatformOps;
    use crate::test_support::{TestBus, TestPlatform};

    fn fixture() -> (Arc<TestBus>, Arc<Monitor>, Arc<MonCtx>) {
        let bus = Arc::new(TestBus::new());
        let platform = Arc::new(TestPlatform::new());
        let monitor =
            Monitor::new(platform as Arc<dyn PlatformOps>, Arc::clone(&bus) as Arc<dyn UsbBus>)
                .unwrap();
        let ctx = monitor.open().unwrap();
        (bus, monitor, ctx)
    }

    fn desc(vendor: u16, product: u16) -> UsbDeviceDesc {
        UsbDeviceDesc {
            vendor,
            product,
            revision: 0x0100,
            class: 0x08,
            subclass: 0x06,
            protocol: 0x50,
        }
    }

    #[test]
    fn control_codes_round_trip() {
        let code = mon_ctl_code(MonFunction::AddFilter);
        assert_eq!(decode_ctl_code(code).unwrap(), MonFunction::AddFilter);
        assert_eq!(decode_ctl_code(0x22 << 16), Err(Error::NotSupported));
    }

    #[test]
    fn version_query_validates_sizes() {
        let (_bus, monitor, ctx) = fixture();
        let mut out = [0u8; 8];
        let written = ioctl(
            &monitor,
            &ctx,
            mon_ctl_code(MonFunction::GetVersion),
            &[],
            &mut out,
        )
        .unwrap();
        assert_eq!(written, 8);
        assert_eq!(u32::from_le_bytes(out[0..4].try_into().unwrap()), MON_MAJOR_VERSION);
        assert_eq!(u32::from_le_bytes(out[4..8].try_into().unwrap()), MON_MINOR_VERSION);

        let mut bad = [0u8; 4];
        assert_eq!(
            ioctl(&monitor, &ctx, mon_ctl_code(MonFunction::GetVersion), &[], &mut bad),
            Err(Error::InvalidParameter)
        );
        monitor.close(&ctx).unwrap();
    }

    #[test]
    fn filter_wire_round_trip() {
        let filter = UsbFilter::capture_for(0x1234, 0x0001);
        let mut wire = [0u8; FILTER_WIRE_SIZE];
        encode_filter(&filter, &mut wire);
        assert_eq!(decode_filter(&wire).unwrap(), filter);

        let mut bad = wire;
        bad[0] = 9;
        assert_eq!(decode_filter(&bad), Err(Error::InvalidParameter));
    }

    #[test]
    fn add_run_and_remove_filter_over_the_wire() {
        let (bus, monitor, ctx) = fixture();
        bus.add_device(PdoId(5), desc(0x1234, 0x0001));

        let mut wire = [0u8; FILTER_WIRE_SIZE];
        encode_filter(&UsbFilter::capture_for(0x1234, 0x0001), &mut wire);
        let mut out = [0u8; 4];
        let written = ioctl(
            &monitor,
            &ctx,
            mon_ctl_code(MonFunction::AddFilter),
            &wire,
            &mut out,
        )
        .unwrap();
        assert_eq!(written, 4);
        let id = u32::from_le_bytes(out);
        assert_ne!(id, 0);

        let mut none = [0u8; 0];
        let _ = ioctl(
            &monitor,
            &ctx,
            mon_ctl_code(MonFunction::RunFilters),
            &[],
            &mut none,
        )
        .unwrap();
        assert!(monitor.filter_engine().pdo_is_filtered(PdoId(5)));

        let _ = ioctl(
            &monitor,
            &ctx,
            mon_ctl_code(MonFunction::RemoveFilter),
            &id.to_le_bytes(),
            &mut none,
        )
        .unwrap();
        assert_eq!(ctx.filter_ctx().active_filters(), 0);
        monitor.close(&ctx).unwrap();
    }

    #[test]
    fn get_device_reports_the_cached_decision() {
        let (bus, monitor, ctx) = fixture();
        bus.add_device(PdoId(5), desc(0x1234, 0x0001));

        let mut small = [0u8; 2];
        assert_eq!(
            ioctl(
                &monitor,
                &ctx,
                mon_ctl_code(MonFunction::GetDevice),
                &5u64.to_le_bytes(),
                &mut small
            ),
            Err(Error::BufferTooSmall { required: 4 })
        );

        let mut out = [0u8; 4];
        let _ = ioctl(
            &monitor,
            &ctx,
            mon_ctl_code(MonFunction::GetDevice),
            &5u64.to_le_bytes(),
            &mut out,
        )
        .unwrap();
        assert_eq!(out[0], 0, "no decision cached yet");
        monitor.close(&ctx).unwrap();
    }

    #[test]
    fn unknown_function_is_rejected() {
        let (_bus, monitor, ctx) = fixture();
        let mut code = 0u32;
        let _ = code.set_bits(16..32, MON_DEVICE_TYPE);
        let _ = code.set_bits(2..14, 0x6FF);
        let mut out = vec![0u8; 8];
        assert_eq!(
            ioctl(&monitor, &ctx, code, &[], &mut out),
            Err(Error::InvalidParameter)
        );
        monitor.close(&ctx).unwrap();
    }
}
