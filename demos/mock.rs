//! A standalone demo that feeds a canned DBGp transcript through the wire
//! codec and logs what it decodes, the framing equivalent of the teacher's
//! original stdin header dump.

use dbgp_bridge::codec::FrameDecoder;
use dbgp_bridge::config::init_logging;
use log::info;

fn canned_transcript() -> Vec<u8> {
    let init = r#"<init idekey="mcp" session="1" appid="1" fileuri="file:///var/www/html/index.php"/>"#;
    let break_response = r#"<response command="run" transaction_id="2" status="break" reason="ok">
        <xdebug:message filename="file:///var/www/html/app/x.php" lineno="42"/>
    </response>"#;

    let mut bytes = Vec::new();
    for xml in [init, break_response] {
        bytes.extend_from_slice(xml.len().to_string().as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(xml.as_bytes());
        bytes.push(0);
    }
    bytes
}

fn main() {
    init_logging(log::LevelFilter::Info);

    let transcript = canned_transcript();
    let mut decoder = FrameDecoder::new();

    // Feed the transcript in arbitrarily small chunks to exercise the same
    // streaming path a live socket would use.
    for chunk in transcript.chunks(7) {
        decoder.push(chunk);
        for message in decoder.drain_messages() {
            let xml = String::from_utf8_lossy(&message);
            info!("decoded frame: {xml}");
        }
    }
}
