//! Image retrieval with a vocabulary tree of binary descriptors.
//!
//! Descriptors are quantized into visual words by descending the tree towards the
//! closest node in Hamming distance. An image becomes a bag of words weighted by
//! term frequency and inverse document frequency and normalized to an L1 norm of `1`.
//! Two bags are compared with the L1 score `1 - ½‖a - b‖₁`, which lies in `[0, 1]`.

use crate::{Descriptor, Error};
use log::*;
use rand::{seq::index::sample, Rng};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

/// Maps a visual word to its weight in an image.
pub type BagOfWords = BTreeMap<usize, f64>;

/// The number of k-majority iterations run at each node while training.
const TRAINING_ITERATIONS: usize = 10;

#[derive(Debug, Clone)]
struct Node {
    children: Vec<usize>,
    descriptor: Descriptor,
    word: Option<usize>,
}

/// A hierarchical clustering of binary descriptors whose leaves are visual words.
#[derive(Debug, Clone)]
pub struct VocabularyTree {
    /// Node `0` is the root.
    nodes: Vec<Node>,
    /// The node of every word.
    words: Vec<usize>,
    /// The inverse document frequency of every word.
    weights: Vec<f64>,
}

impl VocabularyTree {
    /// Loads a vocabulary from its text format.
    ///
    /// Every line describes a node other than the root, in an order where parents come first:
    ///
    /// ```text
    /// parent is_leaf byte_0 ... byte_63 [weight]
    /// ```
    ///
    /// `parent` is the index of the parent node, where the root is `0` and the node on line
    /// `n` (starting at `1`) is `n`. When a `weights` file is given it holds one weight per word
    /// in word order and replaces the weights found in the vocabulary.
    pub fn open(path: impl AsRef<Path>, weights: Option<&Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let invalid = |path: &Path, reason: String| Error::Vocabulary {
            path: path.to_owned(),
            reason,
        };
        let map_io = |path: &Path| {
            let path = path.to_owned();
            move |source| Error::MapIo { path, source }
        };
        let text = std::fs::read_to_string(path).map_err(map_io(path))?;

        let mut nodes = vec![Node {
            children: vec![],
            descriptor: Descriptor::zero(),
            word: None,
        }];
        let mut words = vec![];
        let mut inline_weights = vec![];
        for (line_number, line) in text.lines().enumerate() {
            let line_number = line_number + 1;
            let mut tokens = line.split_whitespace();
            let parent = match tokens.next() {
                Some(parent) => parent,
                None => continue,
            };
            let parent: usize = parent
                .parse()
                .ok()
                .filter(|&parent| parent < nodes.len())
                .ok_or_else(|| invalid(path, format!("line {}: invalid parent {:?}", line_number, parent)))?;
            let is_leaf = match tokens.next() {
                Some("1") => true,
                Some("0") => false,
                other => {
                    return Err(invalid(
                        path,
                        format!("line {}: invalid leaf flag {:?}", line_number, other),
                    ))
                }
            };
            let descriptor = Descriptor::from_decimal_bytes(tokens.by_ref())
                .ok_or_else(|| invalid(path, format!("line {}: invalid descriptor", line_number)))?;
            let weight = tokens
                .next()
                .map(|weight| weight.parse::<f64>())
                .transpose()
                .map_err(|e| invalid(path, format!("line {}: invalid weight: {}", line_number, e)))?;

            let node = nodes.len();
            nodes[parent].children.push(node);
            let word = if is_leaf {
                words.push(node);
                inline_weights.push(weight);
                Some(words.len() - 1)
            } else {
                None
            };
            nodes.push(Node {
                children: vec![],
                descriptor,
                word,
            });
        }

        if words.is_empty() {
            return Err(invalid(path, "the vocabulary has no words".to_owned()));
        }
        if let Some(node) = nodes
            .iter()
            .position(|node| node.word.is_none() && node.children.is_empty())
        {
            return Err(invalid(path, format!("inner node {} has no children", node)));
        }

        let weights = if let Some(weights_path) = weights {
            let text = std::fs::read_to_string(weights_path).map_err(map_io(weights_path))?;
            let weights = text
                .split_whitespace()
                .map(str::parse)
                .collect::<Result<Vec<f64>, _>>()
                .map_err(|e| invalid(weights_path, e.to_string()))?;
            if weights.len() != words.len() {
                return Err(invalid(
                    weights_path,
                    format!("found {} weights for {} words", weights.len(), words.len()),
                ));
            }
            weights
        } else {
            inline_weights
                .into_iter()
                .map(|weight| weight.unwrap_or(1.0))
                .collect()
        };

        info!(
            "loaded vocabulary {} with {} nodes and {} words",
            path.display(),
            nodes.len(),
            words.len()
        );
        Ok(Self {
            nodes,
            words,
            weights,
        })
    }

    /// Builds a vocabulary by recursively clustering descriptors with k-majority.
    ///
    /// Every inner node has at most `branching` children and leaves are at most `depth` levels
    /// below the root. All words start with a weight of `1`.
    pub fn train(descriptors: &[Descriptor], branching: usize, depth: usize, rng: &mut impl Rng) -> Self {
        let branching = branching.max(2);
        let mut nodes = vec![Node {
            children: vec![],
            descriptor: Descriptor::majority(descriptors),
            word: None,
        }];
        let mut pending = vec![(0, descriptors.to_vec(), 0)];
        while let Some((node, cluster, level)) = pending.pop() {
            if level == depth || cluster.len() <= 1 {
                continue;
            }
            for (center, members) in k_majority(&cluster, branching, rng) {
                let child = nodes.len();
                nodes.push(Node {
                    children: vec![],
                    descriptor: center,
                    word: None,
                });
                nodes[node].children.push(child);
                pending.push((child, members, level + 1));
            }
        }

        let mut words = vec![];
        for (index, node) in nodes.iter_mut().enumerate() {
            if node.children.is_empty() {
                node.word = Some(words.len());
                words.push(index);
            }
        }
        debug!(
            "trained vocabulary with {} nodes and {} words from {} descriptors",
            nodes.len(),
            words.len(),
            descriptors.len()
        );
        let weights = vec![1.0; words.len()];
        Self {
            nodes,
            words,
            weights,
        }
    }

    /// Writes the vocabulary in the text format read by [`VocabularyTree::open`].
    pub fn write(&self, mut writer: impl Write) -> std::io::Result<()> {
        let mut parents = vec![0; self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate() {
            for &child in &node.children {
                parents[child] = index;
            }
        }
        // Nodes are stored with parents first, so indices are preserved.
        for (index, node) in self.nodes.iter().enumerate().skip(1) {
            write!(writer, "{} {}", parents[index], u8::from(node.word.is_some()))?;
            for byte in node.descriptor.bytes() {
                write!(writer, " {}", byte)?;
            }
            if let Some(word) = node.word {
                write!(writer, " {}", self.weights[word])?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    pub fn weight(&self, word: usize) -> f64 {
        self.weights[word]
    }

    /// Finds the visual word of a descriptor.
    pub fn quantize(&self, descriptor: &Descriptor) -> usize {
        let mut node = 0;
        while let Some(&closest) = self.nodes[node]
            .children
            .iter()
            .min_by_key(|&&child| descriptor.distance(&self.nodes[child].descriptor))
        {
            node = closest;
        }
        // Every leaf is a word, including a root without children.
        self.nodes[node].word.unwrap_or(0)
    }

    /// Computes the L1-normalized TF-IDF bag of words of an image.
    pub fn bag<'a>(&self, descriptors: impl IntoIterator<Item = &'a Descriptor>) -> BagOfWords {
        let mut bag = BagOfWords::new();
        for descriptor in descriptors {
            let word = self.quantize(descriptor);
            *bag.entry(word).or_insert(0.0) += self.weights[word];
        }
        normalize(&mut bag);
        bag
    }

    /// Replaces the word weights with inverse document frequencies `ln(N / n_w)` computed over
    /// `documents`, where `n_w` is the number of documents containing word `w`.
    ///
    /// Words absent from every document get the largest weight, `ln(N)`.
    pub fn set_idf_weights<'a, D>(&mut self, documents: impl IntoIterator<Item = D>)
    where
        D: IntoIterator<Item = &'a Descriptor>,
    {
        let mut frequencies = vec![0usize; self.words.len()];
        let mut total = 0usize;
        for document in documents {
            total += 1;
            let mut words: Vec<usize> = document
                .into_iter()
                .map(|descriptor| self.quantize(descriptor))
                .collect();
            words.sort_unstable();
            words.dedup();
            for word in words {
                frequencies[word] += 1;
            }
        }
        let total = total.max(1) as f64;
        self.weights = frequencies
            .into_iter()
            .map(|frequency| (total / frequency.max(1) as f64).ln())
            .collect();
    }

    /// The L1 score of two normalized bags of words.
    pub fn score(a: &BagOfWords, b: &BagOfWords) -> f64 {
        let mut difference = 0.0;
        for (word, weight) in a {
            difference += (weight - b.get(word).copied().unwrap_or(0.0)).abs();
        }
        for (word, weight) in b {
            if !a.contains_key(word) {
                difference += weight.abs();
            }
        }
        1.0 - 0.5 * difference
    }
}

fn normalize(bag: &mut BagOfWords) {
    let sum: f64 = bag.values().sum();
    if sum > 0.0 {
        for weight in bag.values_mut() {
            *weight /= sum;
        }
    }
}

/// Splits descriptors into at most `k` clusters around their bitwise majority.
fn k_majority(
    descriptors: &[Descriptor],
    k: usize,
    rng: &mut impl Rng,
) -> Vec<(Descriptor, Vec<Descriptor>)> {
    let k = k.min(descriptors.len());
    let mut centers: Vec<Descriptor> = sample(rng, descriptors.len(), k)
        .into_iter()
        .map(|index| descriptors[index])
        .collect();
    let mut assignments = vec![usize::MAX; descriptors.len()];
    for _ in 0..TRAINING_ITERATIONS {
        let mut changed = false;
        for (assignment, descriptor) in assignments.iter_mut().zip(descriptors) {
            let closest = (0..centers.len())
                .min_by_key(|&center| descriptor.distance(&centers[center]))
                .unwrap_or(0);
            changed |= *assignment != closest;
            *assignment = closest;
        }
        if !changed {
            break;
        }
        for (index, center) in centers.iter_mut().enumerate() {
            let members = descriptors
                .iter()
                .zip(&assignments)
                .filter(|&(_, &assignment)| assignment == index)
                .map(|(descriptor, _)| descriptor);
            let mut members = members.peekable();
            if members.peek().is_some() {
                *center = Descriptor::majority(members);
            }
        }
    }

    let mut clusters: Vec<(Descriptor, Vec<Descriptor>)> =
        centers.into_iter().map(|center| (center, vec![])).collect();
    for (descriptor, &assignment) in descriptors.iter().zip(&assignments) {
        clusters[assignment].1.push(*descriptor);
    }
    clusters.retain(|(_, members)| !members.is_empty());
    clusters
}

/// The bags of words of the views of a scene with an inverted file for fast retrieval.
#[derive(Debug, Clone, Default)]
pub struct ViewDatabase {
    bags: Vec<BagOfWords>,
    /// For every word, the views containing it and the word's weight in them.
    inverted: HashMap<usize, Vec<(usize, f64)>>,
}

impl ViewDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a view and returns its index.
    pub fn add(&mut self, bag: BagOfWords) -> usize {
        let view = self.bags.len();
        for (&word, &weight) in &bag {
            self.inverted.entry(word).or_default().push((view, weight));
        }
        self.bags.push(bag);
        view
    }

    pub fn len(&self) -> usize {
        self.bags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bags.is_empty()
    }

    pub fn bag(&self, view: usize) -> &BagOfWords {
        &self.bags[view]
    }

    /// Retrieves up to `count` views sharing words with `bag`, most similar first.
    ///
    /// For L1-normalized bags, the L1 score is the sum of the minimum weight of the shared
    /// words, so only the views in the inverted file of the query words are scored.
    pub fn query(&self, bag: &BagOfWords, count: usize) -> Vec<(usize, f64)> {
        let mut scores: HashMap<usize, f64> = HashMap::new();
        for (word, &weight) in bag {
            for &(view, view_weight) in self.inverted.get(word).into_iter().flatten() {
                *scores.entry(view).or_insert(0.0) += weight.min(view_weight);
            }
        }
        let mut scores: Vec<(usize, f64)> = scores.into_iter().collect();
        scores.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scores.truncate(count);
        scores
    }
}
