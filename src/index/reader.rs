//! Reader for serialized indices, with range-based partial parsing.
//!
//! Lookups bisect the sorted node region through the transport's range
//! reads instead of fetching the whole file. Every byte range that has been
//! fetched and decoded is remembered in two parallel maps: the byte ranges
//! themselves and the key bounds each range proved. Later lookups answer
//! from those maps when they can, and any read that would exceed half the
//! file escalates to buffering the index wholesale.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::error::{Result, TesseraError};
use crate::format::{parse_header, parse_node_line, Header, HEADER_PROBE_LEN};
use crate::index::{Entry, GraphIndex};
use crate::key::{Key, PrefixKey};
use crate::transport::Transport;

/// Tuning knobs for probing and escalation.
#[derive(Clone, Copy, Debug)]
pub struct Tunables {
    /// Bytes requested for one bisection probe; comfortably larger than
    /// any common node line.
    pub probe_size: usize,
    /// A lookup for more than `key_count / lookup_buffer_factor` keys
    /// buffers the whole index instead of bisecting.
    pub lookup_buffer_factor: u64,
    /// Once `bytes_read * buffer_all_factor` reaches the file size, the
    /// next read buffers the whole index.
    pub buffer_all_factor: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            probe_size: 800,
            lookup_buffer_factor: 20,
            buffer_all_factor: 2,
        }
    }
}

/// Construction options for [`IndexReader`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ReaderOptions {
    /// Byte offset of the index inside a larger container file.
    pub base_offset: u64,
    /// Hint that memory is plentiful. The reader keeps everything it
    /// parses either way; the flag is recorded for callers that tune
    /// eviction above this layer.
    pub unlimited_cache: bool,
    /// Probing and escalation knobs.
    pub tunables: Tunables,
}

/// Point-in-time I/O counters, reset by [`IndexReader::clear_cache`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ReaderStats {
    /// Range-read batches issued.
    pub readv_calls: u64,
    /// Bytes fetched, partial reads and whole-file buffering combined.
    pub bytes_read: u64,
    /// True once the whole index is held in memory.
    pub buffered: bool,
}

/// Real nodes with references resolved to keys.
type BufferedNodes = BTreeMap<Key, (Bytes, Vec<Vec<Key>>)>;

#[derive(Default)]
struct ReaderState {
    header: Option<Header>,
    /// Ascending, non-overlapping byte ranges already decoded.
    parsed_byte_map: Vec<(u64, u64)>,
    /// Key bounds proven covered by the corresponding byte range; `None`
    /// bounds mark the keyless header region.
    parsed_key_map: Vec<(Option<Key>, Option<Key>)>,
    /// Line-start offset to the key serialized there.
    keys_by_offset: FxHashMap<u64, Key>,
    /// Real nodes seen during partial parsing, references still as offsets.
    bisect_nodes: FxHashMap<Key, (Bytes, Vec<Vec<u64>>)>,
    buffered: Option<BufferedNodes>,
    lines_in_order: bool,
    bytes_read: u64,
    readv_calls: u64,
}

struct ParsedLines {
    first_key: Option<Key>,
    last_key: Option<Key>,
    trailers: u32,
    in_order: bool,
}

/// One bisection answer for a (location, key) probe.
enum Probe {
    /// The key is proven absent.
    Absent,
    /// The key sorts below the probed location.
    Lower,
    /// The key sorts above the probed location.
    Higher,
    Found(Entry),
}

fn byte_range_index(map: &[(u64, u64)], offset: u64) -> usize {
    map.partition_point(|range| range.0 <= offset).saturating_sub(1)
}

fn key_range_index(map: &[(Option<Key>, Option<Key>)], key: &Key) -> usize {
    // The leading range starts the file, so its `None` lower bound sorts
    // before every key. A `None` lower bound anywhere else marks a range
    // that decoded no keys (a window onto the trailer) and locates nothing.
    map[1..]
        .partition_point(|range| match &range.0 {
            None => false,
            Some(start) => start <= key,
        })
}

fn resolve_refs(
    keys_by_offset: &FxHashMap<u64, Key>,
    path: &str,
    ref_offsets: &[Vec<u64>],
) -> Result<Vec<Vec<Key>>> {
    let mut lists = Vec::with_capacity(ref_offsets.len());
    for list in ref_offsets {
        let mut keys = Vec::with_capacity(list.len());
        for offset in list {
            let key = keys_by_offset.get(offset).cloned().ok_or_else(|| {
                TesseraError::BadIndexData(format!(
                    "{path}: reference to unparsed offset {offset}"
                ))
            })?;
            keys.push(key);
        }
        lists.push(keys);
    }
    Ok(lists)
}

fn entry_from(key: &Key, value: &Bytes, refs: &[Vec<Key>]) -> Entry {
    Entry {
        key: key.clone(),
        value: value.clone(),
        refs: refs.to_vec(),
    }
}

/// Read access to one serialized index file.
///
/// Construction performs no I/O; the header is fetched on first use. All
/// internal caching sits behind one mutex, so a shared reader serializes
/// its reads.
pub struct IndexReader {
    transport: Arc<dyn Transport>,
    path: String,
    size: Option<u64>,
    base_offset: u64,
    unlimited_cache: bool,
    tunables: Tunables,
    state: Mutex<ReaderState>,
}

impl IndexReader {
    /// Opens an index at `path`. `size` is the byte length of the index
    /// data when known; without it the first read buffers the whole file.
    pub fn open(transport: Arc<dyn Transport>, path: impl Into<String>, size: Option<u64>) -> Self {
        Self::open_with_options(transport, path, size, ReaderOptions::default())
    }

    /// Opens an index with explicit options.
    pub fn open_with_options(
        transport: Arc<dyn Transport>,
        path: impl Into<String>,
        size: Option<u64>,
        options: ReaderOptions,
    ) -> Self {
        IndexReader {
            transport,
            path: path.into(),
            size,
            base_offset: options.base_offset,
            unlimited_cache: options.unlimited_cache,
            tunables: options.tunables,
            state: Mutex::new(ReaderState::default()),
        }
    }

    /// Path of the index on its transport.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// True when the reader was told memory is plentiful.
    pub fn unlimited_cache(&self) -> bool {
        self.unlimited_cache
    }

    /// Current I/O counters.
    pub fn stats(&self) -> ReaderStats {
        let state = self.state.lock();
        ReaderStats {
            readv_calls: state.readv_calls,
            bytes_read: state.bytes_read,
            buffered: state.buffered.is_some(),
        }
    }

    /// Keys referenced from list `ref_list_num` that have no real node in
    /// this index, absent placeholders included. Buffers the whole index.
    pub fn external_references(&self, ref_list_num: usize) -> Result<FxHashSet<Key>> {
        let mut state = self.state.lock();
        self.buffer_all(&mut state)?;
        let header = self.header(&state)?;
        if ref_list_num >= header.node_ref_lists {
            return Err(TesseraError::BadOptions(format!(
                "no reference list {ref_list_num}, index has {}",
                header.node_ref_lists
            )));
        }
        let buffered = self.buffered(&state)?;
        let mut external = FxHashSet::default();
        for (_, (_, ref_lists)) in buffered.iter() {
            for reference in &ref_lists[ref_list_num] {
                if !buffered.contains_key(reference) {
                    external.insert(reference.clone());
                }
            }
        }
        Ok(external)
    }

    fn header(&self, state: &ReaderState) -> Result<Header> {
        state.header.ok_or_else(|| {
            TesseraError::BadIndexData(format!("{}: header unavailable", self.path))
        })
    }

    fn buffered<'a>(&self, state: &'a ReaderState) -> Result<&'a BufferedNodes> {
        state.buffered.as_ref().ok_or_else(|| {
            TesseraError::BadIndexData(format!("{}: index not buffered", self.path))
        })
    }

    fn ensure_header(&self, state: &mut ReaderState) -> Result<()> {
        if state.header.is_some() {
            return Ok(());
        }
        match self.size {
            None => self.buffer_all(state),
            Some(size) => self.read_and_parse(state, size, vec![(0, HEADER_PROBE_LEN)]),
        }
    }

    /// Fetches and decodes the entire index.
    fn buffer_all(&self, state: &mut ReaderState) -> Result<()> {
        if state.buffered.is_some() {
            return Ok(());
        }
        debug!(path = %self.path, "index.buffer_all");
        let mut data = self.transport.read_whole(&self.path)?;
        if self.base_offset > 0 {
            let base = self.base_offset as usize;
            if base > data.len() {
                return Err(TesseraError::BadIndexData(format!(
                    "{}: shorter than its base offset",
                    self.path
                )));
            }
            data.drain(..base);
        }
        if let Some(size) = self.size {
            // The container may continue past the index region.
            if data.len() as u64 > size {
                data.truncate(size as usize);
            }
        }
        state.bytes_read += data.len() as u64;
        self.buffer_all_from(state, data)
    }

    /// Decodes an already-fetched full copy of the index.
    fn buffer_all_from(&self, state: &mut ReaderState, data: Vec<u8>) -> Result<()> {
        if state.buffered.is_some() {
            return Ok(());
        }
        let header = parse_header(&self.path, &data)?;
        // Partial-parse caches are superseded by the full buffer.
        state.keys_by_offset.clear();
        state.bisect_nodes.clear();
        state.parsed_byte_map.clear();
        state.parsed_key_map.clear();
        state.header = Some(header);
        let parsed = self.parse_lines(
            state,
            header,
            header.len as u64,
            &data[header.len..],
            data.len() as u64,
        )?;
        if parsed.trailers != 1 {
            return Err(TesseraError::BadIndexData(format!(
                "{}: missing trailer line",
                self.path
            )));
        }
        state.lines_in_order = parsed.in_order;
        let raw = std::mem::take(&mut state.bisect_nodes);
        let mut nodes = BufferedNodes::new();
        for (key, (value, ref_offsets)) in raw {
            let refs = resolve_refs(&state.keys_by_offset, &self.path, &ref_offsets)?;
            nodes.insert(key, (value, refs));
        }
        state.keys_by_offset.clear();
        state.buffered = Some(nodes);
        Ok(())
    }

    /// Issues the prepared ranges through the transport and decodes the
    /// results, escalating to a full buffer when enough of the file has
    /// already been fetched.
    fn read_and_parse(
        &self,
        state: &mut ReaderState,
        size: u64,
        ranges: Vec<(u64, usize)>,
    ) -> Result<()> {
        if ranges.is_empty() {
            return Ok(());
        }
        if state.buffered.is_none()
            && state.bytes_read.saturating_mul(self.tunables.buffer_all_factor) >= size
        {
            return self.buffer_all(state);
        }
        let shifted: Vec<(u64, usize)> = if self.base_offset != 0 {
            ranges
                .iter()
                .map(|(start, len)| (start + self.base_offset, *len))
                .collect()
        } else {
            ranges
        };
        let chunks =
            self.transport
                .read_ranges(&self.path, &shifted, true, Some(size + self.base_offset))?;
        state.readv_calls += 1;
        trace!(path = %self.path, requested = shifted.len(), chunks = chunks.len(), "index.readv");
        for (chunk_offset, mut data) in chunks {
            state.bytes_read += data.len() as u64;
            let mut offset = chunk_offset as i64 - self.base_offset as i64;
            if offset < 0 {
                // Latency expansion reached into the container bytes that
                // precede this index.
                let trim = (-offset) as usize;
                if trim >= data.len() {
                    continue;
                }
                data.drain(..trim);
                offset = 0;
            }
            let mut offset = offset as u64;
            if offset == 0 && data.len() as u64 == size {
                // The transport expanded our ranges into the whole file.
                return self.buffer_all_from(state, data);
            }
            let mut body = &data[..];
            if state.header.is_none() {
                if offset != 0 {
                    return Err(TesseraError::BadIndexData(format!(
                        "{}: header region missing from first read",
                        self.path
                    )));
                }
                let header = parse_header(&self.path, body)?;
                state.header = Some(header);
                self.record_parsed(state, 0, None, header.len as u64, None);
                body = &body[header.len..];
                offset = header.len as u64;
            }
            if !body.is_empty() {
                self.parse_region(state, size, offset, body)?;
            }
        }
        Ok(())
    }

    /// Decodes one fetched region, segment by segment between the ranges
    /// that are already parsed.
    fn parse_region(
        &self,
        state: &mut ReaderState,
        size: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let end = offset + data.len() as u64;
        let mut high_parsed = offset;
        loop {
            let index = byte_range_index(&state.parsed_byte_map, high_parsed);
            if end < state.parsed_byte_map[index].1 {
                return Ok(());
            }
            let (new_high, last_segment) =
                self.parse_segment(state, size, offset, data, end, index)?;
            if last_segment || new_high <= high_parsed {
                return Ok(());
            }
            high_parsed = new_high;
        }
    }

    /// Decodes the unparsed slice of `data` that follows parsed range
    /// `index`, trimming partial lines at both edges.
    ///
    /// Returns the end offset of what was decoded and whether this was the
    /// last decodable segment in `data`. A segment with no complete line
    /// is skipped; the escalation threshold still counts its bytes, so
    /// repeated fruitless probes end in a full buffer.
    fn parse_segment(
        &self,
        state: &mut ReaderState,
        size: u64,
        offset: u64,
        data: &[u8],
        end: u64,
        index: usize,
    ) -> Result<(u64, bool)> {
        let mut trim_start: Option<usize> = None;
        let mut trim_end: Option<usize> = None;
        let lower_end = state.parsed_byte_map[index].1;
        let start_adjacent = if offset < lower_end {
            trim_start = Some((lower_end - offset) as usize);
            true
        } else {
            offset == lower_end
        };
        let end_adjacent;
        let last_segment;
        if end == size {
            end_adjacent = true;
            last_segment = true;
        } else if index + 1 == state.parsed_byte_map.len() {
            end_adjacent = false;
            last_segment = true;
        } else {
            let next_start = state.parsed_byte_map[index + 1].0;
            if end == next_start {
                end_adjacent = true;
                last_segment = true;
            } else if end > next_start {
                trim_end = Some((next_start - offset) as usize);
                end_adjacent = true;
                last_segment = end < state.parsed_byte_map[index + 1].1;
            } else {
                end_adjacent = false;
                last_segment = true;
            }
        }
        if !start_adjacent {
            let from = trim_start.unwrap_or(0);
            match data[from..].iter().position(|b| *b == b'\n') {
                Some(i) => trim_start = Some(from + i + 1),
                None => return Ok((end, true)),
            }
        }
        if !end_adjacent {
            let to = trim_end.unwrap_or(data.len());
            match data[..to].iter().rposition(|b| *b == b'\n') {
                Some(i) => trim_end = Some(i + 1),
                None => return Ok((end, true)),
            }
        }
        let lo = trim_start.unwrap_or(0);
        let hi = trim_end.unwrap_or(data.len());
        if lo >= hi {
            return Ok((end, true));
        }
        let trimmed = &data[lo..hi];
        let segment_offset = offset + lo as u64;
        let header = self.header(state)?;
        let parsed = self.parse_lines(state, header, segment_offset, trimmed, size)?;
        let segment_end = segment_offset + trimmed.len() as u64;
        self.record_parsed(
            state,
            segment_offset,
            parsed.first_key,
            segment_end,
            parsed.last_key,
        );
        Ok((segment_end, last_segment))
    }

    /// Decodes whole node lines, filling the offset and key caches.
    fn parse_lines(
        &self,
        state: &mut ReaderState,
        header: Header,
        start: u64,
        data: &[u8],
        size: u64,
    ) -> Result<ParsedLines> {
        let mut lines: Vec<&[u8]> = data.split(|b| *b == b'\n').collect();
        lines.pop();
        let mut pos = start;
        let mut parsed = ParsedLines {
            first_key: None,
            last_key: None,
            trailers: 0,
            in_order: true,
        };
        for line in lines {
            if line.is_empty() {
                // The trailer: legal only as the very last byte.
                if pos + 1 != size {
                    return Err(TesseraError::BadIndexData(format!(
                        "{}: blank line at offset {pos} before the end of the index",
                        self.path
                    )));
                }
                parsed.trailers += 1;
                continue;
            }
            let node =
                parse_node_line(&self.path, line, header.key_elements, header.node_ref_lists)?;
            if let Some(previous) = &parsed.last_key {
                if *previous >= node.key {
                    parsed.in_order = false;
                }
            }
            state.keys_by_offset.insert(pos, node.key.clone());
            if parsed.first_key.is_none() {
                parsed.first_key = Some(node.key.clone());
            }
            parsed.last_key = Some(node.key.clone());
            if !node.absent {
                state
                    .bisect_nodes
                    .insert(node.key, (node.value, node.ref_offsets.into_vec()));
            }
            pos += line.len() as u64 + 1;
        }
        Ok(parsed)
    }

    /// Merges `[start, end)` with key bounds into the parsed maps,
    /// coalescing with adjacent ranges.
    fn record_parsed(
        &self,
        state: &mut ReaderState,
        start: u64,
        start_key: Option<Key>,
        end: u64,
        end_key: Option<Key>,
    ) {
        if state.parsed_byte_map.is_empty() {
            state.parsed_byte_map.push((start, end));
            state.parsed_key_map.push((start_key, end_key));
            return;
        }
        let index = byte_range_index(&state.parsed_byte_map, start);
        let touches_lower = state.parsed_byte_map[index].1 == start;
        let touches_upper = index + 1 < state.parsed_byte_map.len()
            && state.parsed_byte_map[index + 1].0 == end;
        if touches_lower && touches_upper {
            let upper = state.parsed_byte_map.remove(index + 1);
            let (_, upper_end_key) = state.parsed_key_map.remove(index + 1);
            state.parsed_byte_map[index].1 = upper.1;
            state.parsed_key_map[index].1 = upper_end_key;
        } else if touches_lower {
            state.parsed_byte_map[index].1 = end;
            state.parsed_key_map[index].1 = end_key;
        } else if touches_upper {
            state.parsed_byte_map[index + 1].0 = start;
            state.parsed_key_map[index + 1].0 = start_key;
        } else {
            state.parsed_byte_map.insert(index + 1, (start, end));
            state.parsed_key_map.insert(index + 1, (start_key, end_key));
        }
    }

    /// Answers a batch of (location, key) probes: from cache when the
    /// covering region is parsed, otherwise by reading around the probe
    /// locations first.
    fn lookup_keys_via_location(
        &self,
        state: &mut ReaderState,
        size: u64,
        location_keys: &[(u64, Key)],
    ) -> Result<Vec<((u64, Key), Probe)>> {
        let mut readv: Vec<(u64, usize)> = Vec::new();
        for (location, key) in location_keys {
            if state.header.is_some() && state.bisect_nodes.contains_key(key) {
                continue;
            }
            if !state.parsed_key_map.is_empty() && self.key_region_answers(state, size, key) {
                continue;
            }
            if !state.parsed_byte_map.is_empty() {
                let index = byte_range_index(&state.parsed_byte_map, *location);
                let (range_start, range_end) = state.parsed_byte_map[index];
                if range_start <= *location && range_end > *location {
                    continue;
                }
            }
            let mut length = self.tunables.probe_size as u64;
            if location + length > size {
                length = size - location;
            }
            if length > 0 {
                readv.push((*location, length as usize));
            }
        }
        if state.header.is_none() {
            readv.push((0, HEADER_PROBE_LEN));
        }
        self.read_and_parse(state, size, readv)?;
        if let Some(buffered) = &state.buffered {
            // The read escalated to a full buffer; answer everything.
            return Ok(location_keys
                .iter()
                .map(|(location, key)| {
                    let probe = match buffered.get(key) {
                        None => Probe::Absent,
                        Some((value, refs)) => Probe::Found(entry_from(key, value, refs)),
                    };
                    ((*location, key.clone()), probe)
                })
                .collect());
        }
        let mut result = Vec::with_capacity(location_keys.len());
        let mut pending_references: Vec<(u64, Key)> = Vec::new();
        let mut pending_locations: FxHashSet<u64> = FxHashSet::default();
        for (location, key) in location_keys {
            if let Some((value, ref_offsets)) = state.bisect_nodes.get(key) {
                let mut wanted: Vec<u64> = Vec::new();
                for offset in ref_offsets.iter().flatten() {
                    if !state.keys_by_offset.contains_key(offset) {
                        wanted.push(*offset);
                    }
                }
                if !wanted.is_empty() {
                    pending_locations.extend(wanted);
                    pending_references.push((*location, key.clone()));
                    continue;
                }
                let refs = resolve_refs(&state.keys_by_offset, &self.path, ref_offsets)?;
                result.push((
                    (*location, key.clone()),
                    Probe::Found(Entry {
                        key: key.clone(),
                        value: value.clone(),
                        refs,
                    }),
                ));
                continue;
            }
            if self.key_region_answers(state, size, key) {
                result.push(((*location, key.clone()), Probe::Absent));
                continue;
            }
            let index = byte_range_index(&state.parsed_byte_map, *location);
            let probe = match &state.parsed_key_map[index].0 {
                Some(range_start) if key < range_start => Probe::Lower,
                // A keyless range only ever sits against the trailer, so
                // every key sorts below it.
                None if state.parsed_byte_map[index].0 > 0 => Probe::Lower,
                _ => Probe::Higher,
            };
            result.push(((*location, key.clone()), probe));
        }
        let mut readv: Vec<(u64, usize)> = Vec::new();
        for location in &pending_locations {
            // Reference offsets come from the file, so an offset past the
            // end is corruption rather than a short read.
            if *location >= size {
                return Err(TesseraError::BadIndexData(format!(
                    "{}: reference offset {location} is past the end of the index",
                    self.path
                )));
            }
            let mut length = self.tunables.probe_size as u64;
            if location + length > size {
                length = size - location;
            }
            if length > 0 {
                readv.push((*location, length as usize));
            }
        }
        self.read_and_parse(state, size, readv)?;
        if let Some(buffered) = &state.buffered {
            for (location, key) in pending_references {
                let (value, refs) = buffered.get(&key).ok_or_else(|| {
                    TesseraError::BadIndexData(format!(
                        "{}: {key:?} vanished while buffering",
                        self.path
                    ))
                })?;
                let probe = Probe::Found(entry_from(&key, value, refs));
                result.push(((location, key), probe));
            }
            return Ok(result);
        }
        for (location, key) in pending_references {
            let (value, ref_offsets) = state.bisect_nodes.get(&key).ok_or_else(|| {
                TesseraError::BadIndexData(format!(
                    "{}: {key:?} vanished from the parse cache",
                    self.path
                ))
            })?;
            let refs = resolve_refs(&state.keys_by_offset, &self.path, ref_offsets)?;
            let entry = Entry {
                key: key.clone(),
                value: value.clone(),
                refs,
            };
            result.push(((location, key), Probe::Found(entry)));
        }
        Ok(result)
    }

    /// True when a parsed region proves where `key` would live, so a miss
    /// there is a definitive absence.
    fn key_region_answers(&self, state: &ReaderState, size: u64, key: &Key) -> bool {
        if state.parsed_key_map.is_empty() {
            return false;
        }
        let index = key_range_index(&state.parsed_key_map, key);
        let (range_start, range_end) = &state.parsed_key_map[index];
        let start_le = match range_start {
            // Only the range at the start of the file can vouch for keys
            // below its first decoded key.
            None => state.parsed_byte_map[index].0 == 0,
            Some(start) => start <= key,
        };
        let end_ge = match range_end {
            None => false,
            Some(end) => end >= key,
        };
        start_le && (end_ge || state.parsed_byte_map[index].1 == size)
    }

    /// Bisects for `keys`, probing around a moving location per key until
    /// every key is found or proven absent.
    fn bisect_lookup(
        &self,
        state: &mut ReaderState,
        size: u64,
        keys: &[&Key],
    ) -> Result<Vec<Entry>> {
        let mut found = Vec::new();
        let mut delta = (size / 2).max(1);
        let mut search: Vec<(u64, Key)> =
            keys.iter().map(|key| (size / 2, (*key).clone())).collect();
        while !search.is_empty() {
            let responses = self.lookup_keys_via_location(state, size, &search)?;
            if delta > 1 {
                delta /= 2;
            }
            let mut next = Vec::new();
            for ((location, key), probe) in responses {
                match probe {
                    Probe::Absent => {}
                    Probe::Lower => next.push((location.saturating_sub(delta), key)),
                    Probe::Higher => {
                        next.push(((location + delta).min(size.saturating_sub(1)), key))
                    }
                    Probe::Found(entry) => found.push(entry),
                }
            }
            search = next;
        }
        Ok(found)
    }

    fn key_count_locked(&self, state: &mut ReaderState) -> Result<u64> {
        self.ensure_header(state)?;
        Ok(self.header(state)?.key_count)
    }
}

impl GraphIndex for IndexReader {
    /// Exact for a well-formed index; taken from the header without a
    /// full parse.
    fn key_count(&self) -> Result<u64> {
        let mut state = self.state.lock();
        self.key_count_locked(&mut state)
    }

    /// Buffers the index and returns every entry in ascending key order.
    fn iter_all_entries(&self) -> Result<Vec<Entry>> {
        let mut state = self.state.lock();
        self.buffer_all(&mut state)?;
        let buffered = self.buffered(&state)?;
        Ok(buffered
            .iter()
            .map(|(key, (value, refs))| entry_from(key, value, refs))
            .collect())
    }

    fn iter_entries(&self, keys: &[Key]) -> Result<Vec<Entry>> {
        let mut seen: FxHashSet<&Key> = FxHashSet::default();
        let requested: Vec<&Key> = keys.iter().filter(|key| seen.insert(*key)).collect();
        if requested.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state.lock();
        let size = match self.size {
            None => {
                self.buffer_all(&mut state)?;
                0
            }
            Some(size) => size,
        };
        if state.buffered.is_none() {
            // Roughly twenty nodes fit a minimum read, so asking for more
            // than a twentieth of the index tends to touch most of it.
            let count = self.key_count_locked(&mut state)?;
            if requested.len() as u64 * self.tunables.lookup_buffer_factor > count {
                self.buffer_all(&mut state)?;
            }
        }
        if let Some(buffered) = &state.buffered {
            return Ok(requested
                .iter()
                .filter_map(|key| {
                    buffered
                        .get(*key)
                        .map(|(value, refs)| entry_from(key, value, refs))
                })
                .collect());
        }
        self.bisect_lookup(&mut state, size, &requested)
    }

    /// Prefix matching buffers the whole index; it exists to thunk many
    /// small indices into one namespace, where a full parse is expected.
    fn iter_entries_prefix(&self, prefixes: &[PrefixKey]) -> Result<Vec<Entry>> {
        let mut seen: FxHashSet<&PrefixKey> = FxHashSet::default();
        let mut state = self.state.lock();
        let mut entries = Vec::new();
        if prefixes.is_empty() {
            return Ok(entries);
        }
        self.buffer_all(&mut state)?;
        let arity = self.header(&state)?.key_elements;
        let buffered = self.buffered(&state)?;
        for prefix in prefixes {
            if !seen.insert(prefix) {
                continue;
            }
            prefix.check(arity)?;
            if let Some(key) = prefix.as_exact_key() {
                if let Some((value, refs)) = buffered.get(&key) {
                    entries.push(entry_from(&key, value, refs));
                }
                continue;
            }
            let concrete: Vec<Bytes> = prefix.concrete_elements().cloned().collect();
            let start = Key::new(concrete.iter().cloned());
            for (key, (value, refs)) in buffered.range(start..) {
                if !key.starts_with(&concrete) {
                    break;
                }
                entries.push(entry_from(key, value, refs));
            }
        }
        Ok(entries)
    }

    /// Fully parses the index: every line must decode, lines must be in
    /// ascending key order, the trailer must be present exactly once and
    /// the header count must match the real nodes.
    fn validate(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.buffer_all(&mut state)?;
        if !state.lines_in_order {
            return Err(TesseraError::BadIndexData(format!(
                "{}: nodes out of order",
                self.path
            )));
        }
        let header = self.header(&state)?;
        let buffered = self.buffered(&state)?;
        if buffered.len() as u64 != header.key_count {
            return Err(TesseraError::BadIndexData(format!(
                "{}: header counts {} nodes, index has {}",
                self.path,
                header.key_count,
                buffered.len()
            )));
        }
        Ok(())
    }

    fn clear_cache(&self) {
        let mut state = self.state.lock();
        *state = ReaderState::default();
    }
}
