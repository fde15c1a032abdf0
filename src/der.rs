use crate::error::Error;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_INTEGER: u8 = 0x02;

/// Converts a DER `SEQUENCE { INTEGER r, INTEGER s }` ECDSA signature
/// into the fixed-width `r || s` form JWS requires, each half
/// left-padded with zeros to `pad_len` bytes.
///
/// DER integers carry a leading `0x00` whenever the high bit of the
/// value would read as a sign; those are stripped before padding.
///
/// # Errors
/// Returns `Error::MalformedSignature` on any structural mismatch.
pub(crate) fn ec_der_to_raw(der: &[u8], pad_len: usize) -> Result<Vec<u8>, Error> {
    if der.first() != Some(&TAG_SEQUENCE) {
        return Err(Error::MalformedSignature("missing SEQUENCE tag"));
    }
    // Signatures over P-521 exceed 127 content bytes and use the
    // long-form length (0x81 <len>); shorter curves use short form.
    let header_len = if der.get(1) == Some(&0x81) { 3 } else { 2 };
    let mut rest = der
        .get(header_len..)
        .ok_or(Error::MalformedSignature("truncated SEQUENCE header"))?;

    let mut raw = Vec::with_capacity(pad_len * 2);
    for _ in 0..2 {
        rest = append_integer(rest, pad_len, &mut raw)?;
    }
    Ok(raw)
}

/// Reads one `INTEGER` TLV from `input`, appends its padded value to
/// `out` and returns the remaining bytes.
fn append_integer<'a>(
    input: &'a [u8],
    pad_len: usize,
    out: &mut Vec<u8>,
) -> Result<&'a [u8], Error> {
    if input.first() != Some(&TAG_INTEGER) {
        return Err(Error::MalformedSignature("missing INTEGER tag"));
    }
    let len = *input
        .get(1)
        .ok_or(Error::MalformedSignature("truncated INTEGER length"))? as usize;
    let bytes = input
        .get(2..2 + len)
        .ok_or(Error::MalformedSignature("INTEGER shorter than its length"))?;

    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let value = &bytes[start..];
    if value.len() > pad_len {
        return Err(Error::MalformedSignature("INTEGER wider than the curve"));
    }

    out.resize(out.len() + pad_len - value.len(), 0);
    out.extend_from_slice(value);
    Ok(&input[2 + len..])
}
