//! Graph Expander - 관계 그래프로 검색 결과 보강
//!
//! 직접 검색된 청크는 항상 먼저, 순서대로 들어가며 예산 때문에 빠지지 않습니다.
//! 확장 후보 우선순위:
//! 1. 홉 수
//! 2. 종류: 인용 대상(References) > 인접 청크(Follows) > 같은 구조의 형제 청크
//! 3. 출발 청크의 점수 (내림차순), 출발 청크 순위, 발견 순서
//!
//! 예산(청크 텍스트 바이트 합계)을 넘기는 첫 후보에서 확장을 멈춥니다.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::graph::RelationshipGraph;
use super::retriever::ScoredChunk;
use crate::config::ExpansionSettings;

// ============================================================================
// Types
// ============================================================================

/// 확장 경로
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionTier {
    /// 인용된 구조 단위의 청크
    Reference = 0,
    /// 앞/뒤 청크
    Adjacent = 1,
    /// 같은 구조 노드의 다른 청크
    Sibling = 2,
}

/// 컨텍스트에 포함되는 이유
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkOrigin {
    /// 직접 검색 결과
    Retrieved { rank: usize, score: f32 },
    /// 그래프 확장
    Expanded {
        tier: ExpansionTier,
        hop: usize,
        /// 출발한 직접 검색 청크
        from: String,
    },
}

/// 확장 결과 항목
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpandedChunk {
    pub chunk_id: String,
    pub origin: ChunkOrigin,
}

impl ExpandedChunk {
    pub fn is_retrieved(&self) -> bool {
        matches!(self.origin, ChunkOrigin::Retrieved { .. })
    }
}

/// 확장 설정
#[derive(Debug, Clone)]
pub struct ExpanderConfig {
    /// 최대 홉 수 (0이면 확장 없음)
    pub depth: usize,
    /// 기본 예산 (바이트)
    pub budget: usize,
}

impl Default for ExpanderConfig {
    fn default() -> Self {
        Self::from(&ExpansionSettings::default())
    }
}

impl From<&ExpansionSettings> for ExpanderConfig {
    fn from(settings: &ExpansionSettings) -> Self {
        Self {
            depth: settings.depth,
            budget: settings.budget_chars,
        }
    }
}

/// 정렬 전 후보
struct Candidate {
    chunk_id: String,
    hop: usize,
    tier: ExpansionTier,
    origin_score: f32,
    origin_rank: usize,
    discovery: usize,
    from: String,
}

// ============================================================================
// GraphExpander
// ============================================================================

/// 그래프 확장기 (상태 없음, 같은 입력이면 같은 출력)
#[derive(Debug, Clone, Default)]
pub struct GraphExpander {
    config: ExpanderConfig,
}

impl GraphExpander {
    pub fn new(config: ExpanderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExpanderConfig {
        &self.config
    }

    /// 검색 결과를 그래프로 확장
    ///
    /// # Arguments
    /// * `ranked` - 리랭크된 직접 검색 결과
    /// * `graph` - 관계 그래프
    /// * `budget` - 예산 (None이면 설정값)
    pub fn expand(
        &self,
        ranked: &[ScoredChunk],
        graph: &RelationshipGraph,
        budget: Option<usize>,
    ) -> Vec<ExpandedChunk> {
        let budget = budget.unwrap_or(self.config.budget);
        let mut output: Vec<ExpandedChunk> = Vec::new();
        let mut included: HashSet<String> = HashSet::new();
        let mut used = 0usize;

        // 1. 직접 검색 결과
        for (rank, hit) in ranked.iter().enumerate() {
            if !included.insert(hit.chunk_id.clone()) {
                continue;
            }
            used += graph.chunk_len(&hit.chunk_id).unwrap_or(hit.text.len());
            output.push(ExpandedChunk {
                chunk_id: hit.chunk_id.clone(),
                origin: ChunkOrigin::Retrieved {
                    rank,
                    score: hit.score,
                },
            });
        }

        if self.config.depth == 0 || used >= budget {
            return output;
        }

        // 2. 후보 수집
        let mut candidates = self.collect_candidates(ranked, graph);
        candidates.sort_by(|a, b| {
            a.hop
                .cmp(&b.hop)
                .then_with(|| a.tier.cmp(&b.tier))
                .then_with(|| b.origin_score.total_cmp(&a.origin_score))
                .then_with(|| a.origin_rank.cmp(&b.origin_rank))
                .then_with(|| a.discovery.cmp(&b.discovery))
        });

        // 3. 예산 안에서 추가
        for candidate in candidates {
            if included.contains(&candidate.chunk_id) {
                continue;
            }
            let Some(len) = graph.chunk_len(&candidate.chunk_id) else {
                continue;
            };
            if used + len > budget {
                tracing::debug!(
                    "Expansion budget reached at {} ({} + {} > {})",
                    candidate.chunk_id,
                    used,
                    len,
                    budget
                );
                break;
            }

            used += len;
            included.insert(candidate.chunk_id.clone());
            output.push(ExpandedChunk {
                chunk_id: candidate.chunk_id,
                origin: ChunkOrigin::Expanded {
                    tier: candidate.tier,
                    hop: candidate.hop,
                    from: candidate.from,
                },
            });
        }

        tracing::debug!(
            "Expanded {} hits to {} chunks ({} bytes)",
            ranked.len(),
            output.len(),
            used
        );
        output
    }

    /// 직접 검색 청크마다 depth 홉까지 후보 탐색 (방문 집합으로 순환 방지)
    fn collect_candidates(&self, ranked: &[ScoredChunk], graph: &RelationshipGraph) -> Vec<Candidate> {
        let direct: HashSet<&str> = ranked.iter().map(|c| c.chunk_id.as_str()).collect();
        // chunk_id → 가장 좋은 후보 인덱스
        let mut best: HashMap<String, usize> = HashMap::new();
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut discovery = 0usize;

        for (rank, hit) in ranked.iter().enumerate() {
            let mut visited: HashSet<String> = HashSet::new();
            visited.insert(hit.chunk_id.clone());
            let mut frontier = vec![hit.chunk_id.clone()];

            for hop in 1..=self.config.depth {
                let mut next = Vec::new();

                for current in &frontier {
                    for (tier, neighbor) in neighbors(graph, current) {
                        if !visited.insert(neighbor.clone()) {
                            continue;
                        }
                        next.push(neighbor.clone());
                        if direct.contains(neighbor.as_str()) {
                            continue;
                        }

                        let candidate = Candidate {
                            chunk_id: neighbor.clone(),
                            hop,
                            tier,
                            origin_score: hit.score,
                            origin_rank: rank,
                            discovery,
                            from: hit.chunk_id.clone(),
                        };
                        discovery += 1;

                        let existing = best.get(&neighbor).copied();
                        match existing {
                            Some(i) if !outranks(&candidate, &candidates[i]) => {}
                            Some(i) => candidates[i] = candidate,
                            None => {
                                best.insert(neighbor, candidates.len());
                                candidates.push(candidate);
                            }
                        }
                    }
                }

                if next.is_empty() {
                    break;
                }
                frontier = next;
            }
        }

        candidates
    }
}

/// 한 청크의 이웃 (종류 순서, 그래프 순서)
fn neighbors(graph: &RelationshipGraph, chunk_id: &str) -> Vec<(ExpansionTier, String)> {
    let mut found = Vec::new();

    for target in graph.reference_targets(chunk_id) {
        for id in graph.chunks_under(target) {
            found.push((ExpansionTier::Reference, id));
        }
    }

    if let Some(next) = graph.next_chunk(chunk_id) {
        found.push((ExpansionTier::Adjacent, next.to_string()));
    }
    if let Some(prev) = graph.previous_chunk(chunk_id) {
        found.push((ExpansionTier::Adjacent, prev.to_string()));
    }

    for id in graph.siblings(chunk_id) {
        found.push((ExpansionTier::Sibling, id));
    }

    found
}

/// 같은 청크에 대한 두 후보 중 a가 앞서는지
fn outranks(a: &Candidate, b: &Candidate) -> bool {
    (a.hop, a.tier)
        .cmp(&(b.hop, b.tier))
        .then_with(|| b.origin_score.total_cmp(&a.origin_score))
        .then_with(|| a.origin_rank.cmp(&b.origin_rank))
        .is_lt()
}

// ============================================================================
// Tests
// ============================================================================
