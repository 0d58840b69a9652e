mod common;

use std::thread;
use std::time::Duration;

use atmux::channel::{ChannelId, ChannelKind};
use atmux::command::{Command, Parsed};
use atmux::error::ResultCode;
use atmux::host::Notification;
use atmux::request::Request;
use common::*;

fn capture_text(cmd: Command) -> Command {
    cmd.parse_with(|input| Parsed::ok(input.response.to_string()))
}

#[test]
fn notification_inside_an_answer_is_split_out() {
    let config = config(&[ChannelKind::Urc]);
    let rig = rig(
        &config,
        vec![Box::new(|cmd: &str| match cmd {
            "AT+COPS?" => Some(
                "\r\n+CMTI: \"SM\",4\r\n\r\n+COPS: 0,0,\"Carrier\"\r\n\r\nOK\r\n".into(),
            ),
            _ => Some(OK.into()),
        })],
    );

    rig.engine()
        .submit(capture_text(
            Command::new(Request::Operator, "AT+COPS?\r")
                .token(1)
                .on_channel(ChannelId(0)),
        ))
        .unwrap();
    assert!(wait_until(|| rig.host.for_token(1).len() == 1));

    let done = &rig.host.for_token(1)[0];
    assert!(done.result.is_success());
    let text = done.data_as::<String>().unwrap();
    assert!(text.contains("+COPS: 0,0,\"Carrier\""));
    assert!(!text.contains("+CMTI"));
    assert_eq!(
        rig.host.notifications(),
        vec![Notification::NewSmsOnSim { index: 4 }]
    );
}

#[test]
fn identical_polls_share_one_round_trip() {
    let config = config(&[ChannelKind::Dlc2]);
    let rig = rig(
        &config,
        vec![Box::new(|cmd: &str| match cmd {
            "AT+CSQ" => {
                thread::sleep(Duration::from_millis(150));
                Some("\r\n+CSQ: 20,99\r\n\r\nOK\r\n".into())
            }
            _ => Some(OK.into()),
        })],
    );
    let engine = rig.engine();

    for token in 1..=3 {
        engine
            .submit(capture_text(
                Command::new(Request::SignalStrength, "AT+CSQ\r").token(token),
            ))
            .unwrap();
    }
    assert!(wait_until(|| rig.host.completions().len() == 3));
    thread::sleep(Duration::from_millis(100));

    assert_eq!(rig.modems[0].count("AT+CSQ"), 1);
    for token in 1..=3 {
        let done = rig.host.for_token(token);
        assert_eq!(done.len(), 1);
        assert!(done[0].result.is_success());
        assert!(done[0].data_as::<String>().unwrap().contains("+CSQ: 20,99"));
    }
}

#[test]
fn second_command_is_skipped_after_failure() {
    let config = config(&[ChannelKind::Oem]);
    let rig = rig(
        &config,
        vec![Box::new(|cmd: &str| match cmd {
            "AT+XFIRST" => Some("\r\nERROR\r\n".into()),
            _ => Some(OK.into()),
        })],
    );

    rig.engine()
        .submit(
            Command::new(Request::OemHookRaw, "AT+XFIRST\r")
                .then("AT+XSECOND\r")
                .token(2),
        )
        .unwrap();
    assert!(wait_until(|| rig.host.for_token(2).len() == 1));
    assert_eq!(rig.host.for_token(2)[0].result, ResultCode::GenericFailure);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(rig.modems[0].count("AT+XSECOND"), 0);
}

#[test]
fn both_parts_of_an_exchange_reach_the_parser() {
    let config = config(&[ChannelKind::Oem]);
    let rig = rig(
        &config,
        vec![Box::new(|cmd: &str| match cmd {
            "AT+XFIRST" => Some("\r\n+XFIRST: 1\r\n\r\nOK\r\n".into()),
            "AT+XSECOND" => Some("\r\n+XSECOND: 2\r\n\r\nOK\r\n".into()),
            _ => Some(OK.into()),
        })],
    );

    rig.engine()
        .submit(capture_text(
            Command::new(Request::OemHookRaw, "AT+XFIRST\r")
                .then("AT+XSECOND\r")
                .token(3),
        ))
        .unwrap();
    assert!(wait_until(|| rig.host.for_token(3).len() == 1));
    let text = rig.host.for_token(3)[0].data_as::<String>().unwrap().clone();
    let first = text.find("+XFIRST: 1").unwrap();
    let second = text.find("+XSECOND: 2").unwrap();
    assert!(first < second);
}
