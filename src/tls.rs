// Minimal ClientHello walk to pull out the server_name extension. Parsing is
// strictly bounds-checked and fail-closed: anything that isn't a well-formed
// handshake record with a ClientHello yields None, and the caller closes the
// connection.

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SERVER_NAME_TYPE_HOST_NAME: u8 = 0x00;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, count: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos.checked_add(count)?)?;
        self.pos += count;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_be_bytes([s[0], s[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|s| usize::from(s[0]) << 16 | usize::from(s[1]) << 8 | usize::from(s[2]))
    }
}

// Get the SNI from a peeked ClientHello if it's valid.
pub(crate) fn parse_sni(record: &[u8]) -> Option<String> {
    let mut cursor = Cursor::new(record);
    if cursor.u8()? != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    // Legacy record version, then the record length.
    cursor.take(2)?;
    let record_length = usize::from(cursor.u16()?);
    let mut handshake = Cursor::new(cursor.take(record_length)?);
    if handshake.u8()? != HANDSHAKE_TYPE_CLIENT_HELLO {
        return None;
    }
    let hello_length = handshake.u24()?;
    let mut hello = Cursor::new(handshake.take(hello_length)?);
    // legacy_version + random
    hello.take(2 + 32)?;
    let session_id_length = usize::from(hello.u8()?);
    hello.take(session_id_length)?;
    let cipher_suites_length = usize::from(hello.u16()?);
    hello.take(cipher_suites_length)?;
    let compression_length = usize::from(hello.u8()?);
    hello.take(compression_length)?;
    let extensions_length = usize::from(hello.u16()?);
    let mut extensions = Cursor::new(hello.take(extensions_length)?);
    loop {
        let extension_type = extensions.u16()?;
        let extension_length = usize::from(extensions.u16()?);
        let data = extensions.take(extension_length)?;
        if extension_type != EXTENSION_SERVER_NAME {
            continue;
        }
        let mut names = Cursor::new(data);
        let list_length = usize::from(names.u16()?);
        let mut list = Cursor::new(names.take(list_length)?);
        loop {
            let name_type = list.u8()?;
            let name_length = usize::from(list.u16()?);
            let name = list.take(name_length)?;
            if name_type == SERVER_NAME_TYPE_HOST_NAME {
                return String::from_utf8(name.to_vec()).ok();
            }
        }
    }
}
