//! The CMUX bootstrap path: query the modem's multiplexer support over
//! the chat, switch it into mux mode, transfer the channel, and keep
//! talking AT over a DLC.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use modemlink::mux::{cmux_set_command, frame, parse_cmux_support, Framing, Mux, MuxEvent};
use modemlink::transport::Channel;
use modemlink::{Chat, MemChannel, Response};

fn pump_chat(chat: &mut Chat<MemChannel>, now: Instant) {
    while chat.process_writable(now) {}
    chat.process_readable();
}

fn read_wire(wire: &mut MemChannel) -> Vec<u8> {
    let mut buf = [0u8; 4096];
    match wire.recv(&mut buf) {
        Ok(n) => buf[..n].to_vec(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn cmux_bootstrap_then_chat_over_dlc() {
    let now = Instant::now();
    let (a, mut modem) = MemChannel::pair();
    let mut chat = Chat::new(a);

    // Step one: query multiplexer support.
    let support: Rc<RefCell<Option<Response>>> = Rc::new(RefCell::new(None));
    let s = support.clone();
    chat.send(
        "AT+CMUX=?",
        &["+CMUX:"],
        Box::new(move |ok, resp| {
            assert!(ok);
            *s.borrow_mut() = Some(resp);
        }),
    );
    pump_chat(&mut chat, now);
    assert_eq!(read_wire(&mut modem), b"AT+CMUX=?\r");

    modem
        .send(b"\r\n+CMUX: (0),(0),(1-7),(10-100)\r\n\r\nOK\r\n")
        .unwrap();
    pump_chat(&mut chat, now);

    let support = support.borrow().clone().expect("support response");
    let cfg = parse_cmux_support(&support).expect("usable mux config");
    assert_eq!(cfg.framing, Framing::Basic);
    assert_eq!(cfg.frame_size, 31);

    // Step two: switch the modem into mux mode.
    let done = Rc::new(Cell::new(false));
    let d = done.clone();
    chat.send(
        &cmux_set_command(&cfg),
        &[],
        Box::new(move |ok, _| {
            assert!(ok);
            d.set(true);
        }),
    );
    pump_chat(&mut chat, now);
    assert_eq!(read_wire(&mut modem), b"AT+CMUX=0,0,7,31\r");

    modem.send(b"\r\nOK\r\n").unwrap();
    pump_chat(&mut chat, now);
    assert!(done.get());

    // Step three: the chat gives the channel up and a fresh mux takes
    // over, opening the control channel.
    let mut mux = Mux::new(chat.into_channel(), cfg.framing, cfg.frame_size);
    mux.start();
    while mux.process_writable() {}

    let wire = read_wire(&mut modem);
    let (_, sabm) = frame::extract_basic(&wire);
    let sabm = sabm.expect("sabm on dlc 0");
    assert_eq!(sabm.dlc, 0);
    assert_eq!(sabm.control, frame::CTRL_SABM);

    // Step four: AT over a DLC.
    let dlc = mux.create_dlc().expect("dlc 1");
    while mux.process_writable() {}
    read_wire(&mut modem);

    let mut dlc_chat = Chat::new(dlc);
    let ok = Rc::new(Cell::new(false));
    let o = ok.clone();
    dlc_chat.send("AT+CFUN?", &["+CFUN:"], Box::new(move |okay, _| o.set(okay)));

    while dlc_chat.process_writable(now) {}
    while mux.process_writable() {}

    let wire = read_wire(&mut modem);
    let (_, data) = frame::extract_basic(&wire);
    let data = data.expect("uih frame");
    assert_eq!(data.dlc, 1);
    assert_eq!(data.data, b"AT+CFUN?\r");

    // The modem answers on the same DLC, split across two reads to
    // exercise reassembly.
    let mut response = [0u8; 64];
    let n = frame::fill_basic(&mut response, 1, frame::CTRL_UIH, b"\r\n+CFUN: 1\r\n\r\nOK\r\n");

    modem.send(&response[..4]).unwrap();
    assert!(mux.process_readable());
    assert!(mux.take_events().is_empty());

    modem.send(&response[4..n]).unwrap();
    assert!(mux.process_readable());
    assert_eq!(mux.take_events(), vec![MuxEvent::Readable(1)]);

    dlc_chat.process_readable();
    assert!(ok.get());
}
