//! HID-over-FunctionFS convenience layer: builds the descriptor set for a
//! single HID interface, dispatches the HID class SETUP requests a userspace
//! FunctionFS HID device still has to answer itself (the kernel's `f_hid`
//! configfs function handles these for you; plain FunctionFS does not), and
//! exposes report I/O over the underlying AIO streams.

use super::{EndpointHandle, Event, FunctionFs, SetupHandler, SetupPacket, SetupResponse};
use crate::aio::stream::{AioReader, AioWriter, ErrorPolicy};
use crate::descriptor::hid::{HidFunctionDescriptors, HidProtocol, HidSubclass};
use crate::error::{Error, Result};
use async_trait::async_trait;

const REQ_GET_REPORT: u8 = 0x01;
const REQ_GET_IDLE: u8 = 0x02;
const REQ_GET_PROTOCOL: u8 = 0x03;
const REQ_SET_REPORT: u8 = 0x09;
const REQ_SET_IDLE: u8 = 0x0a;
const REQ_SET_PROTOCOL: u8 = 0x0b;

const RECIPIENT_INTERFACE: u8 = 1;
const CLASS_REQUEST: u8 = 1;

/// The two protocol modes SET_PROTOCOL/GET_PROTOCOL switch between (boot devices
/// start in report protocol per the HID spec, despite the name).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMode {
    Boot,
    Report,
}

/// Runtime state the HID SETUP dispatcher needs across calls: the idle rate and
/// protocol mode are host-settable and must be echoed back on GET.
struct HidControlState {
    idle_rate: u8,
    protocol: ProtocolMode,
    last_set_report: Option<Vec<u8>>,
}

/// A HID function layered over a mounted [`FunctionFs`] instance.
pub struct HidFunction {
    ffs: FunctionFs,
    writer: AioWriter,
    reader: Option<AioReader>,
    report_len: usize,
    control: HidControlState,
}

impl HidFunction {
    /// Builds the descriptor set for a single-interface HID function. Call
    /// [`FunctionFs::mount`] with the returned descriptors/strings, then
    /// [`HidFunction::attach`] once BIND/ENABLE have been observed.
    pub fn descriptors(
        interface_number: u8,
        subclass: HidSubclass,
        protocol: HidProtocol,
        report_descriptor_len: u16,
        in_endpoint: crate::descriptor::Endpoint,
        out_endpoint: Option<crate::descriptor::Endpoint>,
    ) -> HidFunctionDescriptors {
        HidFunctionDescriptors::new(interface_number, subclass, protocol, report_descriptor_len, in_endpoint, out_endpoint)
    }

    /// Takes ownership of a mounted, enabled `FunctionFs` plus its opened endpoint
    /// handles and wraps them as a HID-capable function. `out_endpoint` is `None`
    /// for input-report-only devices (e.g. a keyboard exposing no LED state via
    /// SET_REPORT on the OUT pipe — such devices still answer SET_REPORT on `ep0`).
    pub async fn attach(
        ffs: FunctionFs,
        in_endpoint: EndpointHandle,
        out_endpoint: Option<EndpointHandle>,
        report_len: usize,
        window_size: usize,
    ) -> Result<Self> {
        let writer = in_endpoint.into_writer(report_len, window_size).await?;
        let reader = match out_endpoint {
            Some(ep) => Some(ep.into_reader(report_len, window_size, ErrorPolicy::Ignore).await?),
            None => None,
        };
        Ok(Self {
            ffs,
            writer,
            reader,
            report_len,
            control: HidControlState { idle_rate: 0, protocol: ProtocolMode::Report, last_set_report: None },
        })
    }

    /// Awaits the next `ep0` event, transparently answering any HID class SETUP
    /// request it carries and returning only events the caller still needs to act
    /// on (BIND/UNBIND/ENABLE/DISABLE/SUSPEND/RESUME).
    pub async fn next_event(&mut self) -> Result<Event> {
        loop {
            let event = self.ffs.next_event().await?;
            if let Event::Setup(setup) = event {
                self.handle_setup(&setup).await?;
                continue;
            }
            return Ok(event);
        }
    }
}

#[async_trait]
impl SetupHandler for HidFunction {
    async fn handle_setup(&mut self, setup: &SetupPacket) -> Result<()> {
        if setup.recipient() != RECIPIENT_INTERFACE || setup.request_class() != CLASS_REQUEST {
            self.ffs.respond_setup(setup, SetupResponse::Stall).await?;
            return Ok(());
        }

        let response = match setup.request {
            REQ_GET_REPORT => {
                let report = self.control.last_set_report.clone().unwrap_or_else(|| vec![0u8; self.report_len]);
                SetupResponse::Data(report)
            }
            REQ_GET_IDLE => SetupResponse::Data(vec![self.control.idle_rate]),
            REQ_GET_PROTOCOL => {
                let v = if self.control.protocol == ProtocolMode::Boot { 0 } else { 1 };
                SetupResponse::Data(vec![v])
            }
            REQ_SET_IDLE => {
                self.control.idle_rate = (setup.value >> 8) as u8;
                SetupResponse::Ack
            }
            REQ_SET_PROTOCOL => {
                self.control.protocol = if setup.value == 0 { ProtocolMode::Boot } else { ProtocolMode::Report };
                SetupResponse::Ack
            }
            REQ_SET_REPORT => {
                let data = self.ffs.read_setup_data(setup).await?;
                self.control.last_set_report = Some(data);
                return Ok(());
            }
            _ => SetupResponse::Stall,
        };
        self.ffs.respond_setup(setup, response).await
    }
}

impl HidFunction {
    /// Sends an input report. Resolves once the kernel has transferred it.
    pub async fn send_report(&self, report: &[u8]) -> Result<usize> {
        if report.len() > self.report_len {
            return Err(Error::InvalidArgument {
                syscall: "send_report",
                context: crate::error::Context::Description(format!(
                    "report of {} bytes exceeds configured length {}",
                    report.len(),
                    self.report_len
                )),
                source: nix::errno::Errno::EINVAL,
            });
        }
        self.writer.write(report.to_vec()).await
    }

    /// Receives the next OUT report, if this function declared an OUT endpoint.
    pub async fn recv_report(&mut self) -> Option<Result<Vec<u8>>> {
        let reader = self.reader.as_mut()?;
        reader.demand();
        match reader.next_event().await? {
            crate::aio::stream::ReaderEvent::Data(d) => Some(Ok(d)),
            crate::aio::stream::ReaderEvent::Eof => None,
            crate::aio::stream::ReaderEvent::Error(e) => Some(Err(e)),
        }
    }

    pub async fn dispose(self) {
        self.writer.stop().await;
        if let Some(reader) = self.reader {
            reader.stop().await;
        }
        self.ffs.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_mode_defaults_to_report() {
        let state = HidControlState { idle_rate: 0, protocol: ProtocolMode::Report, last_set_report: None };
        assert_eq!(state.protocol, ProtocolMode::Report);
    }
}
