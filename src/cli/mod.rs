//! CLI 모듈
//!
//! lexgraph-rag CLI 명령어 정의 및 구현

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

use crate::collector::{CollectionStats, CollectorConfig, FileCollector, FileType};
use crate::config::Settings;
use crate::extractor::ContentExtractor;
use crate::knowledge::ChunkOrigin;
use crate::llm::ContextBundle;
use crate::pipeline::{
    MemoryWrite, Pipeline, QueryOptions, QueryOutcome, SourceDocument, StreamOutcome,
};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "lexgraph-rag")]
#[command(version, about = "법령 문서용 그래프 인식 RAG 시스템", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 문서 파일 또는 폴더를 지식베이스에 추가
    Ingest {
        /// 수집할 파일 경로
        #[arg(long)]
        file: Option<PathBuf>,

        /// 수집할 폴더 경로 (기본: 설정의 documents_dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// PDF 파일 건너뛰기
        #[arg(long)]
        skip_pdfs: bool,

        /// 변경이 없어도 재처리
        #[arg(long)]
        force: bool,

        /// 폴더에 더 이상 없는 문서 삭제
        #[arg(long)]
        prune: bool,
    },

    /// 질문하기
    Query {
        /// 질문
        query: String,

        /// 그래프 확장 끄기
        #[arg(long)]
        no_graph: bool,

        /// 응답 스트리밍
        #[arg(long)]
        stream: bool,

        /// 컨텍스트 예산 (바이트)
        #[arg(long)]
        budget: Option<usize>,

        /// 사용한 출처 표시
        #[arg(short, long)]
        sources: bool,
    },

    /// 대화 기록
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },

    /// 관계 그래프 조회
    Graph {
        #[command(subcommand)]
        command: GraphCommand,
    },

    /// 처리된 문서 목록
    List,

    /// 상태 확인
    Status,

    /// 모든 데이터 삭제
    Reset {
        /// 확인 없이 삭제
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum HistoryCommand {
    /// 최근 대화
    Recent {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// 대화 검색
    Search {
        query: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// 대화 기록 삭제
    Clear,
}

#[derive(Subcommand)]
pub enum GraphCommand {
    /// 그래프 통계
    Stats,
    /// 문서 구조 (장/절/조)
    Structure {
        /// 문서 ID
        doc_id: String,
    },
    /// 청크가 인용하는 청크
    Refs {
        /// 청크 ID (예: acts/procurement_act#12)
        chunk_id: String,
    },
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load().context("설정 로드 실패")?;

    match cli.command {
        Commands::Ingest {
            file,
            dir,
            skip_pdfs,
            force,
            prune,
        } => cmd_ingest(&settings, file, dir, skip_pdfs, force, prune).await,
        Commands::Query {
            query,
            no_graph,
            stream,
            budget,
            sources,
        } => {
            let mut options = QueryOptions::from(&settings);
            if no_graph {
                options.use_graph_expansion = false;
            }
            if budget.is_some() {
                options.expansion_budget = budget;
            }
            cmd_query(&settings, &query, &options, stream, sources).await
        }
        Commands::History { command } => cmd_history(&settings, command).await,
        Commands::Graph { command } => cmd_graph(&settings, command).await,
        Commands::List => cmd_list(&settings).await,
        Commands::Status => cmd_status(&settings).await,
        Commands::Reset { yes } => cmd_reset(&settings, yes).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 문서 수집 명령어 (ingest)
async fn cmd_ingest(
    settings: &Settings,
    file: Option<PathBuf>,
    dir: Option<PathBuf>,
    skip_pdfs: bool,
    force: bool,
    prune: bool,
) -> Result<()> {
    let collector = FileCollector::new(CollectorConfig {
        skip_pdfs,
        ..Default::default()
    });

    let files = if let Some(ref file_path) = file {
        match collector.collect_file(file_path)? {
            Some(f) => vec![f],
            None => {
                println!("[!] 지원하지 않는 파일 형식: {:?}", file_path);
                return Ok(());
            }
        }
    } else {
        let dir_path = dir.unwrap_or_else(|| settings.paths.documents_dir.clone());
        collector.collect_directory(&dir_path)?
    };

    if files.is_empty() && !prune {
        println!("[!] 수집할 파일이 없습니다.");
        return Ok(());
    }

    let stats = CollectionStats::from_files(&files);
    println!("[*] 수집 대상: {} 파일", stats.total_files);
    println!("    텍스트: {}, PDF: {}", stats.text_files, stats.pdf_files);
    println!("    총 크기: {}", format_bytes(stats.total_size as usize));
    println!();

    // 텍스트 추출
    let extractor = ContentExtractor::new();
    let mut documents = Vec::with_capacity(files.len());
    let mut extract_errors = 0;
    for (i, collected) in files.iter().enumerate() {
        let type_str = match collected.file_type {
            FileType::Text => "TXT",
            FileType::Pdf => "PDF",
        };
        print!("[{}/{}] [{}] {}... ", i + 1, files.len(), type_str, collected.doc_id);
        let _ = std::io::stdout().flush();

        match extractor.extract(collected).await {
            Ok(doc) => {
                println!("{} 페이지", doc.page_count);
                documents.push(SourceDocument::from(doc));
            }
            Err(e) => {
                println!("실패: {}", e);
                extract_errors += 1;
            }
        }
    }

    let pipeline = Pipeline::open(settings).await?;
    let ingestor = pipeline.ingestor(force);

    // 폴더에서 사라진 문서 정리
    if prune && file.is_none() {
        let present: std::collections::HashSet<&str> =
            files.iter().map(|f| f.doc_id.as_str()).collect();
        for status in pipeline.store().list_documents()? {
            if !present.contains(status.doc_id.as_str())
                && ingestor.remove_document(&status.doc_id).await?
            {
                println!("[*] 삭제됨: {}", status.doc_id);
            }
        }
    }

    // Ctrl+C → 다음 문서 전에 중단
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n[!] 중단 요청됨, 현재 문서까지 처리합니다...");
            let _ = cancel_tx.send(true);
        }
    });

    println!();
    println!("[*] 청킹, 임베딩, 그래프 구성 중...");
    let report = ingestor.ingest(documents, Some(cancel_rx)).await;
    signal_task.abort();
    let report = report?;

    for (doc_id, reason) in &report.failed {
        println!("[!] {} 실패: {}", doc_id, reason);
    }

    println!();
    println!(
        "[OK] 완료: 처리 {}, 변경 없음 {}, 실패 {}",
        report.processed.len(),
        report.skipped,
        report.failed.len() + extract_errors
    );
    println!(
        "     청크 {}, 새 임베딩 {}, 문서 간 인용 {}",
        report.chunks, report.embedded, report.resolved_references
    );
    if report.cancelled {
        println!("[!] 중단되어 일부 문서는 처리되지 않았습니다.");
    }

    Ok(())
}

/// 질문 명령어 (query)
async fn cmd_query(
    settings: &Settings,
    query: &str,
    options: &QueryOptions,
    stream: bool,
    show_sources: bool,
) -> Result<()> {
    let pipeline = Pipeline::open(settings).await?;
    let orchestrator = pipeline.orchestrator();

    if stream {
        match orchestrator.answer_stream(query, options).await? {
            StreamOutcome::NoContext => println!("{}", no_context_message()),
            StreamOutcome::Streaming {
                prepared,
                mut fragments,
            } => {
                if show_sources {
                    print_sources(&prepared.bundle);
                }

                let mut response = String::new();
                let mut stdout = std::io::stdout();
                while let Some(fragment) = fragments.next().await {
                    match fragment {
                        Ok(text) => {
                            print!("{}", text);
                            let _ = stdout.flush();
                            response.push_str(&text);
                        }
                        Err(e) => {
                            println!();
                            println!("[!] 스트림 중단: {:#}", e);
                            break;
                        }
                    }
                }
                println!();

                let answer = orchestrator.complete(prepared, response);
                report_memory(&answer.memory);
            }
        }
        return Ok(());
    }

    match orchestrator.answer(query, options).await? {
        QueryOutcome::NoContext => println!("{}", no_context_message()),
        QueryOutcome::Answered(answer) => {
            if show_sources {
                print_sources(&answer.bundle);
            }
            println!("{}", answer.response);
            report_memory(&answer.memory);
        }
    }

    Ok(())
}

/// 대화 기록 명령어 (history)
async fn cmd_history(settings: &Settings, command: HistoryCommand) -> Result<()> {
    let memory = crate::memory::ConversationMemory::open(
        &settings.paths.memory_db(),
        settings.memory.max_turns,
    )?;

    let turns = match command {
        HistoryCommand::Recent { limit } => memory.recent_window(limit)?,
        HistoryCommand::Search { query, limit } => memory.search(&query, limit)?,
        HistoryCommand::Clear => {
            memory.clear()?;
            println!("[OK] 대화 기록이 삭제되었습니다.");
            return Ok(());
        }
    };

    if turns.is_empty() {
        println!("[!] 대화 기록이 없습니다.");
        return Ok(());
    }

    for turn in turns {
        println!("[{}] Q: {}", turn.timestamp.format("%Y-%m-%d %H:%M"), truncate_text(&turn.query, 100));
        println!("    A: {}", truncate_text(&turn.response, 200));
        if !turn.chunk_ids.is_empty() {
            println!("    출처: {}", turn.chunk_ids.join(", "));
        }
        println!();
    }

    Ok(())
}

/// 그래프 명령어 (graph)
async fn cmd_graph(settings: &Settings, command: GraphCommand) -> Result<()> {
    let pipeline = Pipeline::open(settings).await?;
    let graph = pipeline.graph();
    let graph = graph.read().await;

    match command {
        GraphCommand::Stats => {
            let stats = graph.stats();
            println!("[OK] 관계 그래프");
            println!("     문서: {}", stats.documents);
            println!(
                "     노드: 청크 {}, 구조 {}, 부속서 {}",
                stats.chunk_nodes, stats.section_nodes, stats.target_nodes
            );
            println!(
                "     엣지: contains {}, follows {}, references {}",
                stats.contains_edges, stats.follows_edges, stats.references_edges
            );
            println!("     해석되지 않은 인용: {}", stats.unresolved_mentions);
        }
        GraphCommand::Structure { doc_id } => {
            let structure = graph.document_structure(&doc_id);
            if structure.sections.is_empty() && structure.root_chunks.is_empty() {
                bail!("문서 '{}'를 그래프에서 찾을 수 없습니다", doc_id);
            }
            println!("[OK] {} 구조:\n", doc_id);
            if !structure.root_chunks.is_empty() {
                println!("  (머리말) {} 청크", structure.root_chunks.len());
            }
            for entry in &structure.sections {
                println!(
                    "  {}{} ({} 청크)",
                    "  ".repeat(entry.depth),
                    entry.label,
                    entry.chunk_ids.len()
                );
            }
        }
        GraphCommand::Refs { chunk_id } => {
            if graph.node(&chunk_id).is_none() {
                bail!("청크 '{}'를 찾을 수 없습니다", chunk_id);
            }
            let refs = graph.find_cross_references(&chunk_id);
            if refs.is_empty() {
                println!("[!] {}는 다른 조항을 인용하지 않습니다.", chunk_id);
            } else {
                println!("[OK] {} → {} 청크:", chunk_id, refs.len());
                for id in refs {
                    println!("  {}", id);
                }
            }
        }
    }

    Ok(())
}

/// 목록 명령어 (list)
async fn cmd_list(settings: &Settings) -> Result<()> {
    let store = crate::knowledge::KnowledgeStore::open(&settings.paths.knowledge_db())
        .context("KnowledgeStore 열기 실패")?;
    let docs = store.list_documents().context("문서 목록 조회 실패")?;

    if docs.is_empty() {
        println!("[!] 처리된 문서가 없습니다.");
        return Ok(());
    }

    println!("[OK] 처리된 문서 ({} 건):\n", docs.len());
    for doc in docs {
        let title = doc
            .title
            .as_ref()
            .map(|t| truncate_text(t, 40))
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<30} {}", doc.doc_id, title);
        println!(
            "        {} | {} 청크 | {}",
            doc.processed_at.format("%Y-%m-%d %H:%M"),
            doc.chunk_count,
            &doc.content_hash[..doc.content_hash.len().min(12)]
        );
    }

    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status(settings: &Settings) -> Result<()> {
    println!("lexgraph-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("[*] 데이터 디렉토리: {}", settings.paths.data_dir.display());
    println!("[*] 문서 디렉토리: {}", settings.paths.documents_dir.display());
    println!("[*] Ollama: {}", settings.ollama.base_url);

    let pipeline = match Pipeline::open(settings).await {
        Ok(p) => p,
        Err(e) => {
            println!("[!] 초기화 실패: {:#}", e);
            return Ok(());
        }
    };

    let status = pipeline.status().await?;
    println!(
        "[OK] 문서: {} 건, 청크: {} 개 ({})",
        status.store.document_count,
        status.store.chunk_count,
        format_bytes(status.store.total_content_bytes)
    );
    println!("[OK] 벡터 인덱스 ({}): {} 청크", status.vector_backend, status.vector_count);
    println!(
        "[OK] 그래프: 노드 {}, 인용 {}",
        status.graph.chunk_nodes + status.graph.section_nodes + status.graph.target_nodes,
        status.graph.references_edges
    );
    println!(
        "[OK] 대화 기록: {} / {} 턴",
        status.memory.turn_count, status.memory.max_turns
    );
    println!("[*] 모델: {} (임베딩: {})", status.llm_model, status.embedding_model);

    if status.vector_count != status.store.chunk_count {
        println!("[!] 벡터 수와 청크 수가 다릅니다. `ingest --force`로 다시 맞출 수 있습니다.");
    }

    Ok(())
}

/// 초기화 명령어 (reset)
async fn cmd_reset(settings: &Settings, yes: bool) -> Result<()> {
    if !yes {
        bail!("모든 문서, 벡터, 그래프, 대화 기록이 삭제됩니다. 계속하려면 --yes를 지정하세요");
    }

    let pipeline = Pipeline::open(settings).await?;
    pipeline.clear_all().await?;
    println!("[OK] 모든 데이터가 삭제되었습니다.");
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 관련 컨텍스트가 없을 때 안내문
fn no_context_message() -> &'static str {
    "I apologize, but I couldn't find specific information about your question in the available documents.\n\n\
     This could be because:\n\
     1. The information might not be covered in the ingested documents\n\
     2. Your question might need to be rephrased with more specific terms\n\
     3. The relevant documents might not have been ingested yet\n\n\
     Please try:\n\
     - Rephrasing your question with the chapter, section or rule you are interested in\n\
     - Asking about a more specific provision\n\
     - Checking `lexgraph-rag list` to confirm the relevant documents were ingested"
}

fn print_sources(bundle: &ContextBundle) {
    println!("[*] 출처 ({} 청크):", bundle.chunks.len());
    for chunk in &bundle.chunks {
        let origin = match &chunk.origin {
            ChunkOrigin::Retrieved { score, .. } => format!("검색 {:.3}", score),
            ChunkOrigin::Expanded { tier, from, .. } => format!("{:?} ← {}", tier, from),
        };
        println!(
            "    {} (p.{}) [{}] {}",
            chunk.chunk_id,
            chunk.page,
            origin,
            chunk.section.as_deref().unwrap_or("-")
        );
    }
    println!();
}

fn report_memory(write: &MemoryWrite) {
    if let MemoryWrite::Failed(reason) = write {
        println!("[!] 대화 기록 저장 실패: {}", reason);
    }
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
