//! Lossless JPEG recompression
//!
//! Rebuilds the Huffman tables of a baseline JPEG from the image's own symbol
//! statistics (ITU T.81 Annex K.2) and re-encodes the scan with them. The
//! quantized coefficients are copied bit for bit, so the decoded pixels do not
//! change. Progressive, arithmetic-coded, 12-bit and multi-scan files are left
//! alone.

use crate::error::JpegError;

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const DHT: u8 = 0xC4;
const DRI: u8 = 0xDD;

/// Huffman table slots: 0..4 are DC tables, 4..8 AC tables
const SLOTS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Component {
    id: u8,
    h: u32,
    v: u32,
}

#[derive(Debug)]
struct Frame {
    width: u32,
    height: u32,
    components: Vec<Component>,
}

impl Frame {
    fn max_sampling(&self) -> (u32, u32) {
        let h = self.components.iter().map(|c| c.h).max().unwrap_or(1);
        let v = self.components.iter().map(|c| c.v).max().unwrap_or(1);
        (h, v)
    }
}

#[derive(Debug)]
struct ScanComponent {
    dc: usize,
    ac: usize,
    blocks: u32,
}

#[derive(Debug)]
struct Scan<'a> {
    header: &'a [u8],
    components: Vec<ScanComponent>,
    mcus: usize,
}

/// One Huffman-coded symbol and the raw bits that follow it
#[derive(Debug, Clone, Copy)]
struct Token {
    slot: u8,
    symbol: u8,
    bits: u16,
    len: u8,
}

/// Decoder for one Huffman table (T.81 F.2.2.3)
#[derive(Debug, Clone)]
struct DecodeTable {
    mincode: [i32; 17],
    maxcode: [i32; 17],
    valptr: [usize; 17],
    values: Vec<u8>,
}

impl DecodeTable {
    fn new(bits: &[u8; 16], values: Vec<u8>) -> Result<Self, JpegError> {
        let total: usize = bits.iter().map(|&n| n as usize).sum();
        if total != values.len() || total > 256 {
            return Err(JpegError::Corrupt("Huffman table size mismatch"));
        }

        let mut mincode = [0i32; 17];
        let mut maxcode = [-1i32; 17];
        let mut valptr = [0usize; 17];
        let mut code = 0i32;
        let mut k = 0usize;
        for len in 1..=16 {
            let count = bits[len - 1] as usize;
            if count > 0 {
                valptr[len] = k;
                mincode[len] = code;
                code += count as i32;
                k += count;
                maxcode[len] = code - 1;
            }
            code <<= 1;
        }

        Ok(Self {
            mincode,
            maxcode,
            valptr,
            values,
        })
    }

    fn decode(&self, reader: &mut BitReader<'_>) -> Result<u8, JpegError> {
        let mut code = 0i32;
        for len in 1..=16 {
            code = (code << 1) | reader.bit()? as i32;
            if code <= self.maxcode[len] {
                let index = self.valptr[len] + (code - self.mincode[len]) as usize;
                return self
                    .values
                    .get(index)
                    .copied()
                    .ok_or(JpegError::Corrupt("Huffman code out of range"));
            }
        }
        Err(JpegError::Corrupt("invalid Huffman code"))
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    acc: u32,
    count: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            acc: 0,
            count: 0,
        }
    }

    fn bit(&mut self) -> Result<u32, JpegError> {
        if self.count == 0 {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or(JpegError::Corrupt("entropy-coded data ends early"))?;
            self.pos += 1;
            self.acc = byte as u32;
            self.count = 8;
        }
        self.count -= 1;
        Ok((self.acc >> self.count) & 1)
    }

    fn bits(&mut self, n: u8) -> Result<u16, JpegError> {
        let mut value = 0u16;
        for _ in 0..n {
            value = (value << 1) | self.bit()? as u16;
        }
        Ok(value)
    }
}

struct BitWriter {
    out: Vec<u8>,
    acc: u32,
    count: u32,
}

impl BitWriter {
    fn new(out: Vec<u8>) -> Self {
        Self {
            out,
            acc: 0,
            count: 0,
        }
    }

    fn put(&mut self, code: u32, len: u32) {
        for i in (0..len).rev() {
            self.acc = (self.acc << 1) | ((code >> i) & 1);
            self.count += 1;
            if self.count == 8 {
                let byte = self.acc as u8;
                self.out.push(byte);
                if byte == 0xFF {
                    self.out.push(0x00);
                }
                self.acc = 0;
                self.count = 0;
            }
        }
    }

    /// Pad the final byte with one bits
    fn flush(&mut self) {
        if self.count > 0 {
            let pad = 8 - self.count;
            self.put((1 << pad) - 1, pad);
        }
    }

    fn marker(&mut self, marker: u8) {
        self.out.extend_from_slice(&[0xFF, marker]);
    }
}

/// Re-encode `data` with optimal Huffman tables
pub fn optimize_huffman(data: &[u8]) -> Result<Vec<u8>, JpegError> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != SOI {
        return Err(JpegError::Corrupt("missing start-of-image marker"));
    }

    let mut pos = 2;
    let mut kept: Vec<(u8, &[u8])> = Vec::new();
    let mut tables: [Option<DecodeTable>; SLOTS] = Default::default();
    let mut frame = None;
    let mut restart_interval = 0usize;

    let scan_header = loop {
        let (marker, body, next) = read_segment(data, pos)?;
        pos = next;
        match marker {
            0xC0 | 0xC1 => {
                frame = Some(parse_frame(body)?);
                kept.push((marker, body));
            }
            0xC2 | 0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => {
                return Err(JpegError::Unsupported("not a baseline Huffman JPEG"));
            }
            DHT => parse_dht(body, &mut tables)?,
            DRI => {
                let interval = body
                    .get(..2)
                    .ok_or(JpegError::Corrupt("short restart interval segment"))?;
                restart_interval = u16::from_be_bytes([interval[0], interval[1]]) as usize;
                kept.push((marker, body));
            }
            SOS => break body,
            _ => kept.push((marker, body)),
        }
    };

    let frame = frame.ok_or(JpegError::Corrupt("scan before frame header"))?;
    let scan = parse_scan(scan_header, &frame, &tables)?;
    let (intervals, scan_len) = split_scan(&data[pos..])?;
    let rest = &data[pos + scan_len..];
    if has_second_scan(rest) {
        return Err(JpegError::Unsupported("multi-scan JPEG"));
    }

    let per_interval = if restart_interval > 0 {
        restart_interval
    } else {
        scan.mcus
    };
    if intervals.len() != scan.mcus.div_ceil(per_interval) {
        return Err(JpegError::Corrupt("restart marker count mismatch"));
    }

    let mut tokens = Vec::new();
    let mut boundaries = Vec::with_capacity(intervals.len());
    let mut remaining = scan.mcus;
    for interval in &intervals {
        let mcus = remaining.min(per_interval);
        remaining -= mcus;
        boundaries.push(tokens.len());
        let mut reader = BitReader::new(interval);
        for _ in 0..mcus {
            for component in &scan.components {
                for _ in 0..component.blocks {
                    decode_block(&mut reader, &tables, component, &mut tokens)?;
                }
            }
        }
    }
    boundaries.push(tokens.len());

    let mut freq = vec![[0u64; 257]; SLOTS];
    for token in &tokens {
        freq[token.slot as usize][token.symbol as usize] += 1;
    }

    let mut dht = Vec::new();
    let mut codes = vec![([0u16; 256], [0u8; 256]); SLOTS];
    for (slot, counts) in freq.iter().enumerate() {
        if counts.iter().all(|&n| n == 0) {
            continue;
        }
        let (bits, values) = optimal_table(counts)?;
        codes[slot] = encoder_codes(&bits, &values);
        let class_and_id = if slot < 4 {
            slot as u8
        } else {
            0x10 | (slot - 4) as u8
        };
        dht.push(class_and_id);
        dht.extend_from_slice(&bits);
        dht.extend_from_slice(&values);
    }

    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(&[0xFF, SOI]);
    for (marker, body) in kept {
        write_segment(&mut out, marker, body)?;
    }
    write_segment(&mut out, DHT, &dht)?;
    write_segment(&mut out, SOS, scan.header)?;

    let mut writer = BitWriter::new(out);
    for (i, window) in boundaries.windows(2).enumerate() {
        for token in &tokens[window[0]..window[1]] {
            let (table_codes, table_sizes) = &codes[token.slot as usize];
            let size = table_sizes[token.symbol as usize];
            if size == 0 {
                return Err(JpegError::Corrupt("symbol missing from rebuilt table"));
            }
            writer.put(table_codes[token.symbol as usize] as u32, size as u32);
            writer.put(token.bits as u32, token.len as u32);
        }
        writer.flush();
        if i + 2 < boundaries.len() {
            writer.marker(0xD0 + (i % 8) as u8);
        }
    }

    let mut out = writer.out;
    out.extend_from_slice(rest);
    Ok(out)
}

/// Marker, body and the offset after the segment that starts at `pos`
fn read_segment(data: &[u8], mut pos: usize) -> Result<(u8, &[u8], usize), JpegError> {
    if data.get(pos) != Some(&0xFF) {
        return Err(JpegError::Corrupt("expected a marker"));
    }
    while data.get(pos) == Some(&0xFF) {
        pos += 1;
    }
    let marker = *data
        .get(pos)
        .ok_or(JpegError::Corrupt("file ends inside a marker"))?;
    pos += 1;

    if matches!(marker, SOI | EOI | 0x01 | 0xD0..=0xD7) {
        return Err(JpegError::Corrupt("unexpected marker before scan"));
    }

    let len = data
        .get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]) as usize)
        .ok_or(JpegError::Corrupt("file ends inside a segment length"))?;
    if len < 2 {
        return Err(JpegError::Corrupt("segment length too small"));
    }
    let body = data
        .get(pos + 2..pos + len)
        .ok_or(JpegError::Corrupt("segment runs past end of file"))?;
    Ok((marker, body, pos + len))
}

fn write_segment(out: &mut Vec<u8>, marker: u8, body: &[u8]) -> Result<(), JpegError> {
    let len = u16::try_from(body.len() + 2).map_err(|_| JpegError::Corrupt("segment too long"))?;
    out.extend_from_slice(&[0xFF, marker]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(body);
    Ok(())
}

fn parse_frame(body: &[u8]) -> Result<Frame, JpegError> {
    let header = body
        .get(..6)
        .ok_or(JpegError::Corrupt("short frame header"))?;
    if header[0] != 8 {
        return Err(JpegError::Unsupported("sample precision is not 8 bits"));
    }
    let height = u16::from_be_bytes([header[1], header[2]]) as u32;
    let width = u16::from_be_bytes([header[3], header[4]]) as u32;
    if width == 0 || height == 0 {
        return Err(JpegError::Unsupported("image size defined by DNL marker"));
    }

    let count = header[5] as usize;
    let specs = body
        .get(6..6 + 3 * count)
        .ok_or(JpegError::Corrupt("short frame component list"))?;
    let components = specs
        .chunks_exact(3)
        .map(|spec| {
            let (h, v) = ((spec[1] >> 4) as u32, (spec[1] & 0x0F) as u32);
            if !(1..=4).contains(&h) || !(1..=4).contains(&v) {
                return Err(JpegError::Corrupt("invalid sampling factor"));
            }
            Ok(Component { id: spec[0], h, v })
        })
        .collect::<Result<Vec<_>, _>>()?;
    if components.is_empty() {
        return Err(JpegError::Corrupt("frame without components"));
    }

    Ok(Frame {
        width,
        height,
        components,
    })
}

fn parse_dht(mut body: &[u8], tables: &mut [Option<DecodeTable>; SLOTS]) -> Result<(), JpegError> {
    while !body.is_empty() {
        let class = body[0] >> 4;
        let id = (body[0] & 0x0F) as usize;
        if class > 1 || id > 3 {
            return Err(JpegError::Corrupt("invalid Huffman table id"));
        }
        let mut bits = [0u8; 16];
        bits.copy_from_slice(
            body.get(1..17)
                .ok_or(JpegError::Corrupt("short Huffman table"))?,
        );
        let total: usize = bits.iter().map(|&n| n as usize).sum();
        let values = body
            .get(17..17 + total)
            .ok_or(JpegError::Corrupt("short Huffman table values"))?;
        tables[class as usize * 4 + id] = Some(DecodeTable::new(&bits, values.to_vec())?);
        body = &body[17 + total..];
    }
    Ok(())
}

fn parse_scan<'a>(
    header: &'a [u8],
    frame: &Frame,
    tables: &[Option<DecodeTable>; SLOTS],
) -> Result<Scan<'a>, JpegError> {
    let count = *header
        .first()
        .ok_or(JpegError::Corrupt("empty scan header"))? as usize;
    let specs = header
        .get(1..1 + 2 * count)
        .ok_or(JpegError::Corrupt("short scan header"))?;
    let progression = header
        .get(1 + 2 * count..4 + 2 * count)
        .ok_or(JpegError::Corrupt("short scan header"))?;
    if progression != [0, 63, 0] {
        return Err(JpegError::Unsupported("not a sequential scan"));
    }

    let (hmax, vmax) = frame.max_sampling();
    let interleaved = count > 1;
    let mut components = Vec::with_capacity(count);
    let mut single = None;
    for spec in specs.chunks_exact(2) {
        let component = frame
            .components
            .iter()
            .find(|c| c.id == spec[0])
            .ok_or(JpegError::Corrupt("scan names an unknown component"))?;
        let dc = (spec[1] >> 4) as usize;
        let ac = 4 + (spec[1] & 0x0F) as usize;
        if dc > 3 || ac >= SLOTS || tables[dc].is_none() || tables[ac].is_none() {
            return Err(JpegError::Corrupt("scan uses an undefined Huffman table"));
        }
        components.push(ScanComponent {
            dc,
            ac,
            blocks: if interleaved {
                component.h * component.v
            } else {
                1
            },
        });
        single = Some(*component);
    }

    let mcus = match (interleaved, single) {
        (false, Some(c)) => {
            let cols = (frame.width * c.h).div_ceil(hmax).div_ceil(8);
            let rows = (frame.height * c.v).div_ceil(vmax).div_ceil(8);
            (cols * rows) as usize
        }
        (true, _) => {
            let cols = frame.width.div_ceil(8 * hmax);
            let rows = frame.height.div_ceil(8 * vmax);
            (cols * rows) as usize
        }
        (false, None) => return Err(JpegError::Corrupt("scan without components")),
    };

    Ok(Scan {
        header,
        components,
        mcus,
    })
}

/// Unstuffed restart intervals of a scan, and the scan's length in `data`
fn split_scan(data: &[u8]) -> Result<(Vec<Vec<u8>>, usize), JpegError> {
    let mut intervals = Vec::new();
    let mut current = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        if byte != 0xFF {
            current.push(byte);
            i += 1;
            continue;
        }
        match data.get(i + 1) {
            Some(0x00) => {
                current.push(0xFF);
                i += 2;
            }
            Some(0xD0..=0xD7) => {
                intervals.push(std::mem::take(&mut current));
                i += 2;
            }
            Some(0xFF) => i += 1,
            Some(_) => {
                intervals.push(current);
                return Ok((intervals, i));
            }
            None => break,
        }
    }
    Err(JpegError::Corrupt("scan is not terminated by a marker"))
}

/// Whether another scan follows; anything unparseable counts as one
fn has_second_scan(rest: &[u8]) -> bool {
    let mut pos = 0;
    loop {
        if rest.get(pos) != Some(&0xFF) {
            return true;
        }
        while rest.get(pos) == Some(&0xFF) {
            pos += 1;
        }
        match rest.get(pos) {
            Some(&EOI) => return false,
            Some(&SOS) | None => return true,
            Some(_) => {}
        }
        pos += 1;
        match rest.get(pos..pos + 2) {
            Some(len) => pos += u16::from_be_bytes([len[0], len[1]]) as usize,
            None => return true,
        }
    }
}

fn decode_block(
    reader: &mut BitReader<'_>,
    tables: &[Option<DecodeTable>; SLOTS],
    component: &ScanComponent,
    tokens: &mut Vec<Token>,
) -> Result<(), JpegError> {
    let (Some(dc), Some(ac)) = (&tables[component.dc], &tables[component.ac]) else {
        return Err(JpegError::Corrupt("scan uses an undefined Huffman table"));
    };

    let size = dc.decode(reader)?;
    if size > 11 {
        return Err(JpegError::Corrupt("DC difference out of range"));
    }
    tokens.push(Token {
        slot: component.dc as u8,
        symbol: size,
        bits: reader.bits(size)?,
        len: size,
    });

    let slot = component.ac as u8;
    let mut k = 1;
    while k < 64 {
        let symbol = ac.decode(reader)?;
        let run = (symbol >> 4) as usize;
        let size = symbol & 0x0F;
        if size == 0 {
            tokens.push(Token {
                slot,
                symbol,
                bits: 0,
                len: 0,
            });
            if run == 15 {
                k += 16;
                continue;
            }
            break;
        }
        if size > 10 {
            return Err(JpegError::Corrupt("AC coefficient out of range"));
        }
        k += run;
        if k > 63 {
            return Err(JpegError::Corrupt("AC run past end of block"));
        }
        tokens.push(Token {
            slot,
            symbol,
            bits: reader.bits(size)?,
            len: size,
        });
        k += 1;
    }
    Ok(())
}

/// Code lengths per T.81 K.2, limited to 16 bits
fn optimal_table(counts: &[u64; 257]) -> Result<([u8; 16], Vec<u8>), JpegError> {
    let mut freq = *counts;
    // Reserved symbol keeps any real code from being all ones
    freq[256] = 1;

    let mut codesize = [0usize; 257];
    let mut others: [Option<usize>; 257] = [None; 257];

    loop {
        let mut c1 = None;
        let mut lowest = u64::MAX;
        for (i, &f) in freq.iter().enumerate() {
            if f > 0 && f <= lowest {
                lowest = f;
                c1 = Some(i);
            }
        }
        let mut c2 = None;
        lowest = u64::MAX;
        for (i, &f) in freq.iter().enumerate() {
            if f > 0 && f <= lowest && Some(i) != c1 {
                lowest = f;
                c2 = Some(i);
            }
        }
        let (Some(mut c1), Some(mut c2)) = (c1, c2) else {
            break;
        };

        freq[c1] += freq[c2];
        freq[c2] = 0;

        codesize[c1] += 1;
        while let Some(next) = others[c1] {
            c1 = next;
            codesize[c1] += 1;
        }
        others[c1] = Some(c2);

        codesize[c2] += 1;
        while let Some(next) = others[c2] {
            c2 = next;
            codesize[c2] += 1;
        }
    }

    let mut bits = [0usize; 33];
    for &size in codesize.iter().filter(|&&size| size > 0) {
        if size > 32 {
            return Err(JpegError::Corrupt("Huffman code length overflow"));
        }
        bits[size] += 1;
    }

    for i in (17..=32).rev() {
        while bits[i] > 0 {
            let mut j = i - 2;
            while bits[j] == 0 {
                j -= 1;
            }
            bits[i] -= 2;
            bits[i - 1] += 1;
            bits[j + 1] += 2;
            bits[j] -= 1;
        }
    }

    let mut longest = 16;
    while longest > 0 && bits[longest] == 0 {
        longest -= 1;
    }
    if longest == 0 {
        return Err(JpegError::Corrupt("empty Huffman table"));
    }
    bits[longest] -= 1;

    let mut values = Vec::new();
    for size in 1..=32 {
        for (symbol, &s) in codesize.iter().enumerate().take(256) {
            if s == size {
                values.push(symbol as u8);
            }
        }
    }

    let mut out = [0u8; 16];
    for len in 1..=16 {
        out[len - 1] = bits[len] as u8;
    }
    Ok((out, values))
}

fn encoder_codes(bits: &[u8; 16], values: &[u8]) -> ([u16; 256], [u8; 256]) {
    let mut codes = [0u16; 256];
    let mut sizes = [0u8; 256];
    let mut code = 0u32;
    let mut k = 0;
    for len in 1..=16 {
        for _ in 0..bits[len - 1] {
            if let Some(&symbol) = values.get(k) {
                codes[symbol as usize] = code as u16;
                sizes[symbol as usize] = len as u8;
            }
            k += 1;
            code += 1;
        }
        code <<= 1;
    }
    (codes, sizes)
}
