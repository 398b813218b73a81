use std_alloc::string::String;

use newt_msg::Message;

pub(crate) fn msg_summary(msg: &Message) -> String {
  use core::fmt::Write;

  let mut buf = String::new();
  write!(buf,
         "{:?}: {:?} {} with {} byte payload",
         msg.code.kind(),
         msg.ty,
         String::from_iter(msg.code.to_human()),
         msg.payload.0.len()).ok();
  buf
}
