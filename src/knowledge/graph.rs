//! Relationship Graph - 문서 구조/순서/상호 참조 그래프
//!
//! 노드는 청크, 구조 단위(장/조/규칙), 부속서(Schedule 등) 세 종류이고
//! 엣지는 `Contains`(구조 → 하위 구조/청크), `Follows`(청크 i → i+1),
//! `References`(청크 → 인용된 구조 단위) 세 종류입니다.
//!
//! 상호 참조 해석은 3단계입니다.
//! 1. 문서 추가 중: 지금까지 알려진 같은 문서의 구조로 해석
//! 2. 문서 추가 완료 후: 같은 문서 전체 구조로 재시도
//! 3. 배치 종료 후 `resolve_pending`: 코퍼스 전체에서 해석 (배리어)
//!
//! 끝까지 해석되지 않은 인용은 조용히 버립니다.
//! 저장 위치: ~/.lexgraph-rag/graph.json

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::chunker::{is_annex_label, normalize_label, roman_value, Chunk};

/// 스냅샷 포맷 버전
const SNAPSHOT_VERSION: u32 = 2;

// ============================================================================
// Types
// ============================================================================

/// 엣지 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Contains,
    Follows,
    References,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Contains => "contains",
            EdgeKind::Follows => "follows",
            EdgeKind::References => "references",
        }
    }
}

/// 노드 종류
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// 검색 단위 청크
    Chunk {
        seq: usize,
        /// 청크 텍스트 바이트 길이
        len: usize,
        /// 본문에서 추출한 인용 라벨
        mentions: Vec<String>,
    },
    /// 장/편/조/규칙
    Section { path: Vec<String> },
    /// 계층 밖의 부속서 (Schedule, Annexure, Appendix, Form)
    CrossReferenceTarget { path: Vec<String> },
}

impl NodeKind {
    pub fn is_chunk(&self) -> bool {
        matches!(self, NodeKind::Chunk { .. })
    }

    /// 구조 노드 경로 (청크면 None)
    pub fn path(&self) -> Option<&[String]> {
        match self {
            NodeKind::Chunk { .. } => None,
            NodeKind::Section { path } | NodeKind::CrossReferenceTarget { path } => {
                Some(path.as_slice())
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Chunk { .. } => "chunk",
            NodeKind::Section { .. } => "section",
            NodeKind::CrossReferenceTarget { .. } => "cross_reference_target",
        }
    }
}

/// 그래프 노드
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    pub doc_id: String,
    pub kind: NodeKind,
}

/// 그래프 엣지
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

/// 그래프 통계
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub documents: usize,
    pub chunk_nodes: usize,
    pub section_nodes: usize,
    pub target_nodes: usize,
    pub contains_edges: usize,
    pub follows_edges: usize,
    pub references_edges: usize,
    /// 해석되지 않은 인용 수
    pub unresolved_mentions: usize,
}

/// 문서 구조 항목 (문서 등장 순서)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StructureEntry {
    pub node_id: String,
    pub label: String,
    /// 0 = 최상위
    pub depth: usize,
    /// 이 구조에 직접 속한 청크
    pub chunk_ids: Vec<String>,
}

/// 문서 구조
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocumentStructure {
    pub doc_id: String,
    pub sections: Vec<StructureEntry>,
    /// 구조 헤더 앞에 오는 청크
    pub root_chunks: Vec<String>,
}

/// 해석 범위
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    SameDocument,
    Corpus,
}

#[derive(Serialize, Deserialize)]
struct GraphSnapshot {
    version: u32,
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
}

// ============================================================================
// Mentions
// ============================================================================

static REFERENCE_RE: OnceLock<Regex> = OnceLock::new();

/// 본문에서 구조 인용 라벨 추출 (자기 경로의 라벨은 제외, 등장 순서)
///
/// 로마 숫자는 대문자 정규형만 인용으로 봅니다 (`Chapter III`는 인용, `chapter mix`는 아님).
pub fn extract_mentions(text: &str, own_path: &[String]) -> Vec<String> {
    let re = REFERENCE_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(sections?|rules?|chapter|schedule|annexure|appendix|form)\s+((?-i:\d+[A-Za-z]?(?:\.\d+)?|[IVXLCDM]+))\b",
        )
        .expect("Invalid regex")
    });

    let mut seen = HashSet::new();
    let mut mentions = Vec::new();
    for caps in re.captures_iter(text) {
        let numeral = &caps[2];
        let is_roman = numeral.starts_with(|c: char| c.is_ascii_alphabetic());
        if is_roman && roman_value(numeral).is_none() {
            continue;
        }
        let label = normalize_label(&caps[1], &caps[2]);
        if own_path.contains(&label) {
            continue;
        }
        if seen.insert(label.clone()) {
            mentions.push(label);
        }
    }
    mentions
}

/// 구조 노드 ID: "{doc_id}::{path...}"
pub fn structure_id(doc_id: &str, path: &[String]) -> String {
    format!("{}::{}", doc_id, path.join("/"))
}

// ============================================================================
// RelationshipGraph
// ============================================================================

/// 문서 관계 그래프
///
/// 모든 맵이 정렬 맵이라 같은 입력이면 순회 순서도 같습니다.
#[derive(Debug, Clone, Default)]
pub struct RelationshipGraph {
    nodes: BTreeMap<String, GraphNode>,
    out: BTreeMap<String, BTreeSet<(EdgeKind, String)>>,
    inc: BTreeMap<String, BTreeSet<(EdgeKind, String)>>,
    /// 구조 라벨 → 구조 노드 ID
    labels: BTreeMap<String, BTreeSet<String>>,
}

impl RelationshipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 청크 집합으로 새 그래프 생성
    pub fn build(chunks: &[Chunk]) -> Self {
        let mut graph = Self::new();
        graph.update(chunks);
        graph
    }

    /// 청크에 포함된 문서를 교체하고 코퍼스 전체 해석까지 수행
    pub fn update(&mut self, chunks: &[Chunk]) {
        let mut by_doc: BTreeMap<&str, Vec<&Chunk>> = BTreeMap::new();
        for chunk in chunks {
            by_doc.entry(chunk.doc_id.as_str()).or_default().push(chunk);
        }

        for (doc_id, doc_chunks) in by_doc {
            self.remove_document(doc_id);
            self.add_document(doc_id, doc_chunks);
        }

        self.resolve_pending();
    }

    /// 한 문서 교체 (1, 2단계 해석만 수행)
    ///
    /// 배치 수집 중에 문서별로 호출하고, 모든 문서가 끝나면
    /// `resolve_pending`을 한 번 호출합니다.
    pub fn replace_document(&mut self, doc_id: &str, chunks: &[Chunk]) {
        self.remove_document(doc_id);
        let doc_chunks = chunks.iter().filter(|c| c.doc_id == doc_id).collect();
        self.add_document(doc_id, doc_chunks);
    }

    fn add_document(&mut self, doc_id: &str, mut chunks: Vec<&Chunk>) {
        chunks.sort_by_key(|c| c.seq);

        let mut resolved = 0;
        let mut prev: Option<String> = None;

        for chunk in &chunks {
            let owner = self.ensure_structure(doc_id, &chunk.path);

            self.insert_node(GraphNode {
                id: chunk.id.clone(),
                label: chunk
                    .section_label()
                    .map(|l| format!("{} #{}", l, chunk.seq))
                    .unwrap_or_else(|| chunk.id.clone()),
                doc_id: doc_id.to_string(),
                kind: NodeKind::Chunk {
                    seq: chunk.seq,
                    len: chunk.text.len(),
                    mentions: extract_mentions(chunk.core_text(), &chunk.path),
                },
            });

            if let Some(owner) = owner {
                self.add_edge(&owner, &chunk.id, EdgeKind::Contains);
            }
            if let Some(prev) = prev.as_deref() {
                self.add_edge(prev, &chunk.id, EdgeKind::Follows);
            }

            // pass 1
            resolved += self.resolve_chunk(&chunk.id, Scope::SameDocument);
            prev = Some(chunk.id.clone());
        }

        // pass 2
        for chunk in &chunks {
            resolved += self.resolve_chunk(&chunk.id, Scope::SameDocument);
        }

        tracing::debug!(
            "Graph: added {} chunks for {} ({} references resolved in-document)",
            chunks.len(),
            doc_id,
            resolved
        );
    }

    /// 경로의 모든 접두사에 구조 노드를 만들고 가장 깊은 노드 ID 반환
    fn ensure_structure(&mut self, doc_id: &str, path: &[String]) -> Option<String> {
        let mut parent: Option<String> = None;

        for depth in 1..=path.len() {
            let prefix = &path[..depth];
            let id = structure_id(doc_id, prefix);

            if !self.nodes.contains_key(&id) {
                let label = prefix[depth - 1].clone();
                let kind = if is_annex_label(&label) {
                    NodeKind::CrossReferenceTarget {
                        path: prefix.to_vec(),
                    }
                } else {
                    NodeKind::Section {
                        path: prefix.to_vec(),
                    }
                };
                self.insert_node(GraphNode {
                    id: id.clone(),
                    label,
                    doc_id: doc_id.to_string(),
                    kind,
                });
            }

            if let Some(parent) = parent.as_deref() {
                self.add_edge(parent, &id, EdgeKind::Contains);
            }
            parent = Some(id);
        }

        parent
    }

    /// 코퍼스 전체 해석 (배치의 모든 문서가 추가된 뒤 호출)
    pub fn resolve_pending(&mut self) -> usize {
        let chunk_ids: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.kind.is_chunk())
            .map(|n| n.id.clone())
            .collect();

        let resolved: usize = chunk_ids
            .iter()
            .map(|id| self.resolve_chunk(id, Scope::Corpus))
            .sum();

        if resolved > 0 {
            tracing::debug!("Graph: resolved {} cross-document references", resolved);
        }
        resolved
    }

    fn resolve_chunk(&mut self, chunk_id: &str, scope: Scope) -> usize {
        let (doc_id, mentions) = match self.nodes.get(chunk_id) {
            Some(GraphNode {
                doc_id,
                kind: NodeKind::Chunk { mentions, .. },
                ..
            }) => (doc_id.clone(), mentions.clone()),
            _ => return 0,
        };

        let mut added = 0;
        for label in &mentions {
            if self.has_reference(chunk_id, label) {
                continue;
            }
            if let Some(target) = self.resolve_label(label, &doc_id, scope) {
                self.add_edge(chunk_id, &target, EdgeKind::References);
                added += 1;
            }
        }
        added
    }

    /// 같은 문서 후보 우선, 아니면 노드 ID가 가장 작은 후보
    fn resolve_label(&self, label: &str, doc_id: &str, scope: Scope) -> Option<String> {
        let candidates = self.labels.get(label)?;

        let same_doc = candidates.iter().find(|id| {
            self.nodes
                .get(id.as_str())
                .map(|n| n.doc_id == doc_id)
                .unwrap_or(false)
        });

        match (same_doc, scope) {
            (Some(id), _) => Some(id.clone()),
            (None, Scope::Corpus) => candidates.iter().next().cloned(),
            (None, Scope::SameDocument) => None,
        }
    }

    fn has_reference(&self, chunk_id: &str, label: &str) -> bool {
        self.outgoing(chunk_id, EdgeKind::References)
            .into_iter()
            .any(|target| self.nodes.get(target).map(|n| n.label == label).unwrap_or(false))
    }

    // ------------------------------------------------------------------------
    // Mutation primitives
    // ------------------------------------------------------------------------

    fn insert_node(&mut self, node: GraphNode) {
        if !node.kind.is_chunk() {
            self.labels
                .entry(node.label.clone())
                .or_default()
                .insert(node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
    }

    fn add_edge(&mut self, from: &str, to: &str, kind: EdgeKind) {
        self.out
            .entry(from.to_string())
            .or_default()
            .insert((kind, to.to_string()));
        self.inc
            .entry(to.to_string())
            .or_default()
            .insert((kind, from.to_string()));
    }

    fn remove_node(&mut self, id: &str) {
        let Some(node) = self.nodes.remove(id) else {
            return;
        };

        if let Some(ids) = self.labels.get_mut(&node.label) {
            ids.remove(id);
            if ids.is_empty() {
                self.labels.remove(&node.label);
            }
        }

        for (kind, to) in self.out.remove(id).unwrap_or_default() {
            if let Some(set) = self.inc.get_mut(&to) {
                set.remove(&(kind, id.to_string()));
            }
        }
        for (kind, from) in self.inc.remove(id).unwrap_or_default() {
            if let Some(set) = self.out.get_mut(&from) {
                set.remove(&(kind, id.to_string()));
            }
        }
    }

    /// 문서의 모든 노드와 엣지 제거
    ///
    /// 다른 문서에서 이 문서로 향하던 참조도 끊기며,
    /// 다음 `resolve_pending`에서 다시 해석됩니다.
    pub fn remove_document(&mut self, doc_id: &str) -> usize {
        let ids: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.doc_id == doc_id)
            .map(|n| n.id.clone())
            .collect();

        for id in &ids {
            self.remove_node(id);
        }
        ids.len()
    }

    /// 전체 삭제
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// 전체 엣지 (정렬 순서)
    pub fn edges(&self) -> Vec<GraphEdge> {
        self.out
            .iter()
            .flat_map(|(from, set)| {
                set.iter().map(move |(kind, to)| GraphEdge {
                    from: from.clone(),
                    to: to.clone(),
                    kind: *kind,
                })
            })
            .collect()
    }

    /// 나가는 엣지의 대상
    pub fn outgoing(&self, id: &str, kind: EdgeKind) -> Vec<&str> {
        self.out
            .get(id)
            .map(|set| {
                set.iter()
                    .filter(|(k, _)| *k == kind)
                    .map(|(_, to)| to.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 들어오는 엣지의 출발점
    pub fn incoming(&self, id: &str, kind: EdgeKind) -> Vec<&str> {
        self.inc
            .get(id)
            .map(|set| {
                set.iter()
                    .filter(|(k, _)| *k == kind)
                    .map(|(_, from)| from.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 청크를 직접 포함하는 구조 노드
    pub fn owner(&self, chunk_id: &str) -> Option<&str> {
        self.incoming(chunk_id, EdgeKind::Contains).into_iter().next()
    }

    pub fn next_chunk(&self, chunk_id: &str) -> Option<&str> {
        self.outgoing(chunk_id, EdgeKind::Follows).into_iter().next()
    }

    pub fn previous_chunk(&self, chunk_id: &str) -> Option<&str> {
        self.incoming(chunk_id, EdgeKind::Follows).into_iter().next()
    }

    /// 청크가 인용하는 구조 노드
    pub fn reference_targets(&self, chunk_id: &str) -> Vec<&str> {
        self.outgoing(chunk_id, EdgeKind::References)
    }

    /// 청크 텍스트 길이 (청크 노드가 아니면 None)
    pub fn chunk_len(&self, chunk_id: &str) -> Option<usize> {
        match self.nodes.get(chunk_id).map(|n| &n.kind) {
            Some(NodeKind::Chunk { len, .. }) => Some(*len),
            _ => None,
        }
    }

    fn chunk_order(&self, chunk_id: &str) -> (String, usize) {
        match self.nodes.get(chunk_id) {
            Some(GraphNode {
                doc_id,
                kind: NodeKind::Chunk { seq, .. },
                ..
            }) => (doc_id.clone(), *seq),
            _ => (String::new(), usize::MAX),
        }
    }

    /// 구조 노드 아래 모든 청크 (하위 구조 포함, 문서/seq 순서)
    pub fn chunks_under(&self, node_id: &str) -> Vec<String> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut chunks = Vec::new();

        queue.push_back(node_id);
        visited.insert(node_id);

        while let Some(current) = queue.pop_front() {
            for child in self.outgoing(current, EdgeKind::Contains) {
                if !visited.insert(child) {
                    continue;
                }
                match self.nodes.get(child) {
                    Some(node) if node.kind.is_chunk() => chunks.push(child.to_string()),
                    Some(_) => queue.push_back(child),
                    None => {}
                }
            }
        }

        chunks.sort_by_key(|id| self.chunk_order(id));
        chunks
    }

    /// 같은 구조 노드에 직접 속한 다른 청크 (seq 순서)
    pub fn siblings(&self, chunk_id: &str) -> Vec<String> {
        let Some(owner) = self.owner(chunk_id) else {
            return vec![];
        };

        let mut siblings: Vec<String> = self
            .outgoing(owner, EdgeKind::Contains)
            .into_iter()
            .filter(|id| *id != chunk_id)
            .filter(|id| self.nodes.get(*id).map(|n| n.kind.is_chunk()).unwrap_or(false))
            .map(String::from)
            .collect();

        siblings.sort_by_key(|id| self.chunk_order(id));
        siblings
    }

    /// 같은 대상을 인용하는 다른 청크
    pub fn find_cross_references(&self, chunk_id: &str) -> Vec<String> {
        let mut found = BTreeSet::new();
        for target in self.reference_targets(chunk_id) {
            for source in self.incoming(target, EdgeKind::References) {
                if source != chunk_id {
                    found.insert(source.to_string());
                }
            }
        }
        found.into_iter().collect()
    }

    /// 구조 노드를 인용하는 청크
    pub fn cited_by(&self, node_id: &str) -> Vec<&str> {
        self.incoming(node_id, EdgeKind::References)
    }

    /// 그래프에 있는 문서 ID
    pub fn documents(&self) -> BTreeSet<&str> {
        self.nodes.values().map(|n| n.doc_id.as_str()).collect()
    }

    /// 문서 구조 (등장 순서)
    pub fn document_structure(&self, doc_id: &str) -> DocumentStructure {
        let mut chunks: Vec<&GraphNode> = self
            .nodes
            .values()
            .filter(|n| n.doc_id == doc_id && n.kind.is_chunk())
            .collect();
        chunks.sort_by_key(|n| self.chunk_order(&n.id));

        let mut structure = DocumentStructure {
            doc_id: doc_id.to_string(),
            ..Default::default()
        };
        let mut index: BTreeMap<String, usize> = BTreeMap::new();

        for chunk in chunks {
            let path = self
                .owner(&chunk.id)
                .and_then(|owner| self.nodes.get(owner))
                .and_then(|owner| owner.kind.path());

            let Some(path) = path else {
                structure.root_chunks.push(chunk.id.clone());
                continue;
            };

            for depth in 1..=path.len() {
                let id = structure_id(doc_id, &path[..depth]);
                if !index.contains_key(&id) {
                    index.insert(id.clone(), structure.sections.len());
                    structure.sections.push(StructureEntry {
                        node_id: id,
                        label: path[depth - 1].clone(),
                        depth: depth - 1,
                        chunk_ids: vec![],
                    });
                }
            }

            let owner_id = structure_id(doc_id, path);
            if let Some(&i) = index.get(&owner_id) {
                structure.sections[i].chunk_ids.push(chunk.id.clone());
            }
        }

        structure
    }

    /// 그래프 통계
    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            documents: self.documents().len(),
            ..Default::default()
        };

        for node in self.nodes.values() {
            match &node.kind {
                NodeKind::Chunk { mentions, .. } => {
                    stats.chunk_nodes += 1;
                    stats.unresolved_mentions += mentions
                        .iter()
                        .filter(|label| !self.has_reference(&node.id, label))
                        .count();
                }
                NodeKind::Section { .. } => stats.section_nodes += 1,
                NodeKind::CrossReferenceTarget { .. } => stats.target_nodes += 1,
            }
        }

        for (kind, _) in self.out.values().flatten() {
            match kind {
                EdgeKind::Contains => stats.contains_edges += 1,
                EdgeKind::Follows => stats.follows_edges += 1,
                EdgeKind::References => stats.references_edges += 1,
            }
        }

        stats
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// JSON 스냅샷 저장 (임시 파일 + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create graph directory")?;
            }
        }

        let snapshot = GraphSnapshot {
            version: SNAPSHOT_VERSION,
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges(),
        };
        let json = serde_json::to_string(&snapshot).context("Failed to serialize graph")?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write graph snapshot: {:?}", tmp))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace graph snapshot: {:?}", path))?;

        tracing::debug!("Graph saved to {:?} ({} nodes)", path, self.nodes.len());
        Ok(())
    }

    /// JSON 스냅샷 로드
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read graph snapshot: {:?}", path))?;
        let snapshot: GraphSnapshot =
            serde_json::from_str(&raw).context("Failed to parse graph snapshot")?;

        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!("Unsupported graph snapshot version: {}", snapshot.version);
        }

        let mut graph = Self::new();
        for node in snapshot.nodes {
            graph.insert_node(node);
        }
        for edge in snapshot.edges {
            if !graph.nodes.contains_key(&edge.from) || !graph.nodes.contains_key(&edge.to) {
                anyhow::bail!("Graph snapshot has dangling edge {} -> {}", edge.from, edge.to);
            }
            graph.add_edge(&edge.from, &edge.to, edge.kind);
        }

        tracing::debug!("Graph loaded from {:?} ({} nodes)", path, graph.nodes.len());
        Ok(graph)
    }
}

// ============================================================================
// Tests
// ============================================================================
