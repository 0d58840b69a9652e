mod common;

use atmux::channel::{ChannelId, ChannelKind};
use atmux::command::{Command, Parsed};
use atmux::error::{ExtendedError, ResultCode};
use atmux::request::Request;
use common::*;

fn cpin_state(text: &str) -> Option<String> {
    text.lines()
        .find_map(|l| l.trim().strip_prefix("+CPIN:"))
        .map(|s| s.trim().to_string())
}

fn sim_status_command(token: u64) -> Command {
    Command::new(Request::GetSimStatus, "AT+CPIN?\r")
        .token(token)
        .parse_with(|input| match cpin_state(input.response) {
            Some(state) => Parsed::ok(state),
            None => Parsed::failed(ResultCode::GenericFailure),
        })
}

#[test]
fn sim_status_is_routed_to_dlc8_and_parsed() {
    let config = config(&[ChannelKind::Atcmd, ChannelKind::Dlc8]);
    let rig = rig(
        &config,
        vec![
            answer_ok(),
            Box::new(|cmd: &str| match cmd {
                "AT+CPIN?" => Some("\r\n+CPIN: READY\r\n\r\nOK\r\n".into()),
                _ => Some(OK.into()),
            }),
        ],
    );

    rig.engine().submit(sim_status_command(7)).unwrap();
    assert!(wait_until(|| rig.host.for_token(7).len() == 1));

    let done = &rig.host.for_token(7)[0];
    assert_eq!(done.result, ResultCode::Success);
    assert_eq!(done.channel, ChannelId(1));
    assert_eq!(done.data_as::<String>().map(String::as_str), Some("READY"));
    assert_eq!(rig.modems[1].count("AT+CPIN?"), 1);
    assert_eq!(rig.modems[0].count("AT+CPIN?"), 0);
}

#[test]
fn pin_required_maps_to_result_code() {
    let config = config(&[ChannelKind::Dlc8]);
    let rig = rig(
        &config,
        vec![Box::new(|cmd: &str| match cmd {
            "AT+CPIN?" => Some("\r\n+CME ERROR: 11\r\n".into()),
            _ => Some(OK.into()),
        })],
    );

    rig.engine().submit(sim_status_command(8)).unwrap();
    assert!(wait_until(|| rig.host.for_token(8).len() == 1));

    let done = &rig.host.for_token(8)[0];
    assert_eq!(done.result, ResultCode::SimPinRequired);
    assert_eq!(done.error, Some(ExtendedError::Cme(11)));
    assert!(done.data.is_none());
    // Expected for this request, so no SIM status change is reported.
    assert!(rig.host.notifications().is_empty());
}

#[test]
fn request_without_channel_is_rejected_with_completion() {
    let config = config(&[ChannelKind::Dlc8]);
    let rig = rig(&config, vec![answer_ok()]);

    let err = rig
        .engine()
        .submit(Command::new(Request::Dial, "ATD123;\r").token(9));
    assert!(err.is_err());
    let done = rig.host.for_token(9);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].result, ResultCode::GenericFailure);
}
