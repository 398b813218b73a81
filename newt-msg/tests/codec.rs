use newt_msg::{known, Code, Id, Message, OptNumber, OptValue, Payload, Token, TryFromBytes,
               TryIntoBytes, Type};

#[test]
fn get_time_request_literal_bytes() {
  // CON GET mid=0x0001, Uri-Path "time"
  let bytes: Vec<u8> = vec![0x40, 0x01, 0x00, 0x01, 0xB4, 0x74, 0x69, 0x6D, 0x65];

  let msg = Message::try_from_bytes(&bytes).unwrap();
  assert_eq!(msg.ty, Type::Con);
  assert_eq!(msg.code, Code::GET);
  assert_eq!(msg.id, Id(0x0001));
  assert_eq!(msg.token, Token::empty());
  assert_eq!(msg.path().unwrap().as_deref(), Some("time"));
  assert!(msg.payload.0.is_empty());

  assert_eq!(msg.try_into_bytes().unwrap(), bytes);
}

#[test]
fn piggybacked_content_response_literal_bytes() {
  // ACK 2.05 mid=0x0001, payload "1234"
  let bytes: Vec<u8> = vec![0x60, 0x45, 0x00, 0x01, 0xFF, 0x31, 0x32, 0x33, 0x34];

  let msg = Message::try_from_bytes(&bytes).unwrap();
  assert_eq!(msg.ty, Type::Ack);
  assert_eq!(msg.code, Code::new(2, 5));
  assert_eq!(msg.id, Id(0x0001));
  assert_eq!(msg.payload, Payload(b"1234".to_vec()));

  assert_eq!(msg.try_into_bytes().unwrap(), bytes);
}

#[test]
fn empty_con_ping_literal_bytes() {
  // Empty CON mid=0x1234: a CoAP ping
  let bytes: Vec<u8> = vec![0x40, 0x00, 0x12, 0x34];

  let msg = Message::try_from_bytes(&bytes).unwrap();
  assert!(msg.is_empty());
  assert_eq!(msg.id, Id(0x1234));

  let rst = msg.rst();
  assert_eq!(rst.try_into_bytes().unwrap(), vec![0x70, 0x00, 0x12, 0x34]);
}

#[test]
fn roundtrip_preserves_message() {
  let mut msg = Message::new(Type::Con, Code::GET, Id(77), Token::opaque(b"roundtrip"));
  msg.set_path("sensors/temperature");
  msg.add_option(known::repeat::QUERY, *b"unit=c");
  msg.add_option(known::repeat::QUERY, *b"precision=2");
  msg.set_option(known::no_repeat::ACCEPT, [0u8, 40]);
  msg.set_uint(known::no_repeat::SIZE1, 1024);
  msg.payload = Payload(b"body".to_vec());

  let bytes = msg.clone().try_into_bytes().unwrap();
  assert_eq!(Message::try_from_bytes(&bytes).unwrap(), msg);
}

#[test]
fn roundtrip_with_large_option_values() {
  let mut msg = Message::new(Type::Non, Code::PUT, Id(1), Token::empty());
  // forces the 1-byte and 2-byte length extensions
  msg.set_option(OptNumber(11), vec![7u8; 100]);
  msg.add_option(OptNumber(11), vec![8u8; 300]);

  let bytes = msg.clone().try_into_bytes().unwrap();
  let decoded = Message::try_from_bytes(&bytes).unwrap();
  assert_eq!(decoded.opts[&OptNumber(11)],
             vec![OptValue(vec![7u8; 100]), OptValue(vec![8u8; 300])]);
}

#[test]
fn truncated_messages_rejected() {
  // headers cut short at every length
  for n in 1..4 {
    assert!(Message::try_from_bytes(&vec![0x40u8; n]).is_err());
  }

  // token length nibble says 8, no token bytes follow
  assert!(Message::try_from_bytes([0x48, 0x01, 0x00, 0x01]).is_err());

  // payload marker with nothing after it
  assert!(Message::try_from_bytes([0x40, 0x01, 0x00, 0x01, 0xB4, b't', b'i', b'm', b'e', 0xFF]).is_err());
}
