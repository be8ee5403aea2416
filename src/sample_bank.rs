//! Sample storage and lookup.
//!
//! Decoded WAV files live in a write-once cache keyed by a stable id derived
//! from bank name, sample name, and index. Lookups during playback never
//! touch the filesystem; the engine preloads everything an instrument
//! declares before the transport starts.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

/// An immutable decoded audio buffer.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    pub left: Vec<f32>,
    pub right: Option<Vec<f32>>,
    pub sample_rate: u32,
}

impl SampleBuffer {
    pub fn mono(left: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            left,
            right: None,
            sample_rate,
        }
    }

    pub fn stereo(left: Vec<f32>, right: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            left,
            right: Some(right),
            sample_rate,
        }
    }

    pub fn frames(&self) -> usize {
        self.left.len()
    }

    /// Length in seconds at the buffer's native rate.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// A copy with each channel reversed, for negative playback rates.
    pub fn reversed(&self) -> Self {
        let mut left = self.left.clone();
        left.reverse();
        let right = self.right.clone().map(|mut r| {
            r.reverse();
            r
        });
        Self {
            left,
            right,
            sample_rate: self.sample_rate,
        }
    }
}

/// Identifies one sample slot: the `index`th file named `name` in `bank`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleKey {
    pub bank: String,
    pub name: String,
    pub index: usize,
}

impl SampleKey {
    pub fn new(bank: impl Into<String>, name: impl Into<String>, index: usize) -> Self {
        Self {
            bank: bank.into(),
            name: name.into(),
            index,
        }
    }

    /// Stable cache id.
    pub fn id(&self) -> String {
        format!("{}-{}-{}", self.bank, self.name, self.index)
    }
}

/// The sample cache plus the path-resolution rules that fill it.
pub struct SampleBank {
    buffers: HashMap<String, (PathBuf, Arc<SampleBuffer>)>,
    pending: HashSet<String>,
    /// Explicit file lists registered by the user, keyed bank then name;
    /// indexed modulo length, so any index resolves.
    user_samples: HashMap<String, HashMap<String, Vec<PathBuf>>>,
    search_dirs: Vec<PathBuf>,
}

impl Default for SampleBank {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleBank {
    pub fn new() -> Self {
        let mut search_dirs = vec![PathBuf::from("samples")];
        if let Some(home) = dirs::home_dir() {
            search_dirs.push(home.join(".ostinato").join("samples"));
        }
        Self {
            buffers: HashMap::new(),
            pending: HashSet::new(),
            user_samples: HashMap::new(),
            search_dirs,
        }
    }

    pub fn with_search_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            buffers: HashMap::new(),
            pending: HashSet::new(),
            user_samples: HashMap::new(),
            search_dirs: dirs,
        }
    }

    /// Register explicit files for a sample name within a bank, overriding
    /// directory search for that bank/name pair.
    pub fn add_samples(
        &mut self,
        bank: impl Into<String>,
        name: impl Into<String>,
        paths: Vec<PathBuf>,
    ) {
        self.user_samples
            .entry(bank.into())
            .or_default()
            .insert(name.into(), paths);
    }

    /// Map a key to a file on disk.
    ///
    /// User-registered lists win, indexed modulo their length. Otherwise each
    /// search dir is tried as `dir/bank/name/*.wav` (sorted, indexed modulo
    /// count) and then as the single file `dir/name.wav`.
    pub fn resolve_path(&self, key: &SampleKey) -> Option<PathBuf> {
        if let Some(paths) = self
            .user_samples
            .get(&key.bank)
            .and_then(|names| names.get(&key.name))
        {
            if !paths.is_empty() {
                return Some(paths[key.index % paths.len()].clone());
            }
        }

        for dir in &self.search_dirs {
            let sample_dir = dir.join(&key.bank).join(&key.name);
            if let Ok(entries) = std::fs::read_dir(&sample_dir) {
                let mut files: Vec<PathBuf> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().map(|e| e == "wav").unwrap_or(false))
                    .collect();
                if !files.is_empty() {
                    files.sort();
                    return Some(files[key.index % files.len()].clone());
                }
            }

            let flat = dir.join(format!("{}.wav", key.name));
            if flat.is_file() {
                return Some(flat);
            }
        }
        None
    }

    /// Load (or fetch from cache) the buffer for `key`. Write-once: a key
    /// that has been loaded keeps its original buffer even if the file
    /// changes on disk.
    pub fn load(&mut self, key: &SampleKey) -> Option<(PathBuf, Arc<SampleBuffer>)> {
        let id = key.id();
        if let Some(entry) = self.buffers.get(&id) {
            return Some(entry.clone());
        }

        let path = self.resolve_path(key)?;
        match decode_wav(&path) {
            Ok(buffer) => {
                debug!(id = %id, path = %path.display(), frames = buffer.frames(), "sample loaded");
                let entry = (path, Arc::new(buffer));
                self.buffers.insert(id, entry.clone());
                Some(entry)
            }
            Err(err) => {
                warn!(id = %id, path = %path.display(), %err, "failed to decode sample");
                None
            }
        }
    }

    /// Cache-only lookup, used on the playback path.
    pub fn get(&self, key: &SampleKey) -> Option<Arc<SampleBuffer>> {
        self.buffers.get(&key.id()).map(|(_, b)| b.clone())
    }

    /// Load every key not already cached or in flight.
    pub fn preload(&mut self, keys: &[SampleKey]) {
        for key in keys {
            let id = key.id();
            if self.buffers.contains_key(&id) || self.pending.contains(&id) {
                continue;
            }
            self.pending.insert(id.clone());
            self.load(key);
            self.pending.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Decode a WAV file into f32 channels, deinterleaving stereo.
pub fn decode_wav(path: &Path) -> Result<SampleBuffer, Box<dyn std::error::Error>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()?
        }
    };

    match spec.channels {
        1 => Ok(SampleBuffer::mono(interleaved, spec.sample_rate)),
        2 => {
            let mut left = Vec::with_capacity(interleaved.len() / 2);
            let mut right = Vec::with_capacity(interleaved.len() / 2);
            for frame in interleaved.chunks_exact(2) {
                left.push(frame[0]);
                right.push(frame[1]);
            }
            Ok(SampleBuffer::stereo(left, right, spec.sample_rate))
        }
        n => {
            // Keep the first channel of anything wider.
            let left = interleaved
                .chunks_exact(n as usize)
                .map(|frame| frame[0])
                .collect();
            Ok(SampleBuffer::mono(left, spec.sample_rate))
        }
    }
}
