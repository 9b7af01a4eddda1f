//! Wire Codec: frame/unframe DBGp messages, parse the XML tree, and decode
//! `<property>` elements into Variable Info (spec.md §4.1).

mod frame;
mod value;
mod xml;

pub use frame::{encode_command, FrameDecoder};
pub use value::{decode_base64_to_utf8, decode_file_uri, decode_property, encode_base64, ScalarValue, VariableInfo};
pub use xml::{parse as parse_xml, XmlNode};
